fn main() {
    let code = dkn_compute_launcher::run_cli();
    if code != 0 {
        std::process::exit(code);
    }
}
