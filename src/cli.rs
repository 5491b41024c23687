use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::env_detect::{Host, compute_binary_name, detect_host, resolve_working_dir};
use crate::env_store::{
    self, COMPUTE_VERSION_KEY, Config, ENV_TEMPLATE_URL, JINA_API_KEY, LOG_LEVEL_KEY, MODELS_KEY,
    OLLAMA_HOST_KEY, OLLAMA_PORT_KEY, RequiredDefaults, SERPER_API_KEY,
};
use crate::installer::{ChannelFeed, Downloader, HttpDownloader, Installer, Permissions};
use crate::models::{ModelCatalog, Provider};
use crate::ollama;
use crate::platform::{SystemProcesses, raise_open_file_limit};
use crate::prompt::{Prompter, TerminalPrompter};
use crate::releases::{COMPUTE_REPO_API, Channel, GithubReleases, LAUNCHER_REPO_API, ResolveTag};
use crate::supervisor::{RunMode, Supervisor, SupervisorEvent, SupervisorExit, SupervisorOptions};

/// Admin node key used unless `--dkn-admin-public-key` overrides it.
pub const DEFAULT_ADMIN_PUBLIC_KEY: &str =
    "0208ef5e65a9c656a6f92fb2c770d5d5e2ecffe02a6aade19207f75110be6ae658";

const EXIT_DELAY: Duration = Duration::from_secs(5);
const OPEN_FILE_LIMIT: u64 = 10_000;

const NODE_LOG_INFO: &str = "none,dkn_compute=info,dkn_p2p=info,dkn_workflows=info";
const NODE_LOG_DEBUG: &str =
    "none,dkn_compute=debug,dkn_p2p=debug,dkn_workflows=debug,ollama_workflows=info";
const NODE_LOG_TRACE: &str = "none,dkn_compute=trace,dkn_p2p=trace,dkn_workflows=trace";

#[derive(Debug, Parser)]
#[command(
    name = "dkn-compute-launcher",
    version,
    about = "Sets up, runs and keeps the DKN compute node up to date"
)]
pub struct Cli {
    /// Model to serve on the compute node, repeat for multiple models
    #[arg(short = 'm', long = "model", value_name = "MODEL")]
    models: Vec<String>,
    /// Run the node in the background, logging to logs.txt
    #[arg(short, long)]
    background: bool,
    /// Debug logging for the node and the launcher
    #[arg(long)]
    dev: bool,
    /// Trace logging for the node and the launcher
    #[arg(long, conflicts_with = "dev")]
    trace: bool,
    /// Pick the models interactively, ignoring -m flags
    #[arg(long)]
    pick_models: bool,
    /// Run the latest dev release of the compute node
    #[arg(long)]
    compute_dev_version: bool,
    /// DKN admin node public key, rarely needed
    #[arg(long, default_value = DEFAULT_ADMIN_PUBLIC_KEY)]
    dkn_admin_public_key: String,
    /// Directory holding .env, the node binary and logs (default: launcher's directory)
    #[arg(long, value_name = "DIR")]
    working_dir: Option<PathBuf>,
}

impl Cli {
    fn node_log_level(&self) -> &'static str {
        if self.trace {
            NODE_LOG_TRACE
        } else if self.dev {
            NODE_LOG_DEBUG
        } else {
            NODE_LOG_INFO
        }
    }

    fn channel(&self) -> Channel {
        if self.compute_dev_version {
            Channel::LatestDev
        } else {
            Channel::LatestStable
        }
    }

    fn mode(&self) -> RunMode {
        if self.background {
            RunMode::Background
        } else {
            RunMode::Foreground
        }
    }
}

/// Parses arguments, runs the launcher and returns the process exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();
    init_logging(&cli);

    match launch(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_delay();
            1
        }
    }
}

fn init_logging(cli: &Cli) {
    let default = if cli.trace {
        "dkn_compute_launcher=trace"
    } else if cli.dev {
        "dkn_compute_launcher=debug"
    } else {
        "dkn_compute_launcher=info"
    };
    let filter =
        EnvFilter::try_from_env("DKN_LAUNCHER_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn exit_delay() {
    println!("Terminating in {} seconds...", EXIT_DELAY.as_secs());
    std::thread::sleep(EXIT_DELAY);
}

fn launch(cli: &Cli) -> anyhow::Result<i32> {
    notify_launcher_update();
    println!("************ DKN - Compute Node ************");
    println!("Setting up the environment...\n");

    let working_dir = resolve_working_dir(cli.working_dir.as_deref())?;
    let env_path = working_dir.join(".env");
    let catalog = ModelCatalog::default();
    let mut prompter = TerminalPrompter;

    let mut config = env_store::load_or_fetch(&working_dir, ENV_TEMPLATE_URL)
        .context("loading the environment")?;
    env_store::ensure_required(
        &mut config,
        &RequiredDefaults {
            admin_public_key: cli.dkn_admin_public_key.clone(),
        },
        &mut prompter,
    )?;

    select_models(cli, &catalog, &mut config, &mut prompter)?;
    let providers = catalog.providers_for(config.get(MODELS_KEY).unwrap_or_default());
    for provider in &providers {
        ensure_api_key(*provider, &mut config, &mut prompter)?;
    }

    if providers.contains(&Provider::Ollama) {
        let endpoint = ollama::ensure_running(config.get(OLLAMA_HOST_KEY), config.get(OLLAMA_PORT_KEY))?;
        config.set(OLLAMA_HOST_KEY, endpoint.host);
        config.set(OLLAMA_PORT_KEY, endpoint.port);
        println!(
            "Ollama host: {}:{}\n",
            config.get(OLLAMA_HOST_KEY).unwrap_or_default(),
            config.get(OLLAMA_PORT_KEY).unwrap_or_default()
        );
    } else {
        println!("No Ollama model provided. Skipping the Ollama execution\n");
    }

    for (key, label) in [(JINA_API_KEY, "Jina"), (SERPER_API_KEY, "Serper")] {
        if config.is_missing(key) {
            let answer = prompter.ask(&format!(
                "Enter your {label} API key (optional, just press enter for skipping it)"
            ))?;
            config.set(key, answer);
        }
    }

    config.set(LOG_LEVEL_KEY, cli.node_log_level());

    let host = detect_host();
    let installer = Installer::for_host(
        &host,
        HttpDownloader::new()?,
        GithubReleases::new(COMPUTE_REPO_API)?,
    )?;
    let binary_path = working_dir.join(compute_binary_name());
    install_compute(cli.channel(), &installer, &binary_path, &mut config)?;

    match raise_open_file_limit(OPEN_FILE_LIMIT) {
        Ok(limit) => debug!(limit, "open file limit"),
        Err(err) => println!("Error during ulimit: {err}"),
    }

    if let Err(err) = env_store::persist(&config, &env_path) {
        println!("Failed to save the .env file, continuing to run the node though: {err}");
    }

    print_summary(&config, &host);

    let mut options = SupervisorOptions::new(cli.mode(), working_dir, compute_binary_name());
    options.verbose_updates = cli.dev || cli.trace;
    let supervisor = Supervisor::new(
        SystemProcesses,
        ChannelFeed::new(installer, cli.channel()),
        config,
        options,
    );

    match cli.mode() {
        RunMode::Background => println!("\nStarting in BACKGROUND mode...\n"),
        RunMode::Foreground => {
            println!("\nStarting in FOREGROUND mode...\n");
            let events = supervisor.events();
            ctrlc::set_handler(move || {
                let _ = events.send(SupervisorEvent::Interrupted);
            })
            .context("installing the Ctrl-C handler")?;
        }
    }

    Ok(report_exit(supervisor.run()?, &host))
}

/// Prints how the supervisor ended and returns the exit code.
fn report_exit(exit: SupervisorExit, host: &Host) -> i32 {
    match exit {
        SupervisorExit::Detached { pid, log_file } => {
            println!("All good! Compute node is up and running with PID: {pid}");
            println!("You can check the logs from {}", log_file.display());
            if host.is_windows() {
                println!("For stopping the background node you can run: taskkill /PID {pid} /F");
            } else {
                println!("For stopping the background node you can run: kill {pid}");
            }
        }
        SupervisorExit::ChildExited { pid } => {
            println!("Compute node (PID {pid}) is no longer running, closing the launcher.");
        }
        SupervisorExit::Interrupted => {
            println!("\nShutting down the compute node launcher, bye!");
        }
    }
    0
}

fn select_models(
    cli: &Cli,
    catalog: &ModelCatalog,
    config: &mut Config,
    prompter: &mut dyn Prompter,
) -> anyhow::Result<()> {
    if !cli.models.is_empty() {
        config.set(MODELS_KEY, cli.models.join(","));
    }
    if !config.is_missing(MODELS_KEY) && !cli.pick_models {
        return Ok(());
    }

    println!("\nPlease pick the model you want to run:\n");
    println!("{}", catalog.render_table());
    let answer = prompter.ask("Enter the model ids (comma separated, e.g: 1,2,4)")?;
    let selection = catalog.parse_selection(&answer);
    if !selection.invalid.is_empty() {
        println!(
            "Skipping the invalid selections: [{}]\n",
            selection.invalid.join(", ")
        );
    }
    if selection.models.is_empty() {
        bail!("No valid model picked");
    }

    config.set(MODELS_KEY, selection.to_csv());
    Ok(())
}

fn ensure_api_key(
    provider: Provider,
    config: &mut Config,
    prompter: &mut dyn Prompter,
) -> anyhow::Result<()> {
    let Some(key) = provider.api_key_env() else {
        return Ok(());
    };
    if !config.is_missing(key) {
        return Ok(());
    }

    let answer = prompter.ask(&format!("Enter your {provider} API Key"))?;
    if answer.is_empty() {
        bail!("Invalid input, please place your {key} to .env file");
    }
    config.set(key, answer);
    Ok(())
}

/// Makes sure the binary at `binary_path` matches the newest release on `channel`.
fn install_compute<D: Downloader, R: ResolveTag>(
    channel: Channel,
    installer: &Installer<D, R>,
    binary_path: &Path,
    config: &mut Config,
) -> anyhow::Result<()> {
    let latest = installer
        .resolver()
        .resolve(channel)
        .context("Couldn't get the latest dkn-compute version")?;
    let recorded = config.get(COMPUTE_VERSION_KEY);

    if binary_path.is_file() && recorded == Some(latest.as_str()) {
        println!("Current version is up to date ({latest})");
        return Ok(());
    }

    if binary_path.is_file() {
        println!("New dkn-compute version detected ({latest}), downloading it...");
    } else {
        println!("Downloading the latest dkn-compute binary ({latest})");
    }
    let installed = installer
        .install(&latest, binary_path, Permissions::Executable)
        .context("downloading the dkn-compute binary")?;
    println!(
        "Installed dkn-compute {} at {}",
        installed.version,
        installed.path.display()
    );
    config.set(COMPUTE_VERSION_KEY, installed.version);
    Ok(())
}

fn notify_launcher_update() {
    let latest = GithubReleases::new(LAUNCHER_REPO_API).and_then(|r| r.resolve(Channel::LatestStable));
    match latest {
        Ok(tag) if tag.trim_start_matches('v') != env!("CARGO_PKG_VERSION") => {
            println!(
                "Dria Compute Launcher has a new version ({tag})! To be able to use latest models please update it from: https://dria.co/join\n"
            );
        }
        Ok(_) => {}
        Err(err) => warn!("could not check for a new launcher version: {err}"),
    }
}

fn print_summary(config: &Config, host: &Host) {
    println!("\nLog level: {}", config.get(LOG_LEVEL_KEY).unwrap_or_default());
    println!("Models: {}", config.get(MODELS_KEY).unwrap_or_default());
    println!(
        "Operating System: {} {} ({}, {} GiB RAM)",
        host.os, host.os_version, host.cpu_arch, host.ram_gb
    );
}
