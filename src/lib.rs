pub mod cli;
pub mod env_detect;
pub mod env_store;
pub mod installer;
pub mod models;
pub mod monitor;
pub mod ollama;
pub mod platform;
pub mod prompt;
pub mod releases;
pub mod supervisor;

/// Run the command line interface and return an exit code.
pub fn run_cli() -> i32 {
    cli::run()
}
