use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::env_detect::has_command;

pub const DEFAULT_OLLAMA_PORT: u16 = 11434;
pub const LOCAL_HOST: &str = "http://localhost";
pub const DOCKER_HOST: &str = "http://host.docker.internal";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const START_RETRIES: u32 = 5;
const START_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum OllamaError {
    #[error(
        "Ollama is required for the selected models but is not installed, get it from https://ollama.com/download"
    )]
    NotInstalled,
    #[error("failed to run `ollama serve`: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Ollama failed to start after {0} retries")]
    NotReady(u32),
}

/// Where the compute node should reach Ollama.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OllamaEndpoint {
    pub host: String,
    pub port: String,
}

/// Normalizes host/port from the env file, rewriting the Docker host alias to
/// localhost and filling defaults.
pub fn local_endpoint(host: Option<&str>, port: Option<&str>) -> (String, String) {
    let host = match host {
        None | Some(DOCKER_HOST) => LOCAL_HOST.to_string(),
        Some(h) => h.trim_end_matches('/').to_string(),
    };
    let port = port
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_OLLAMA_PORT.to_string());
    (host, port)
}

/// `true` if an Ollama server answers 200 at `host:port`.
pub fn is_serving(host: &str, port: &str) -> bool {
    let url = format!("{host}:{port}");
    let client = match reqwest::blocking::Client::builder()
        .timeout(HEALTH_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };

    match client.get(&url).send() {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            debug!(%url, "ollama health check failed: {err}");
            false
        }
    }
}

/// Reuses a running local Ollama or starts `ollama serve` and waits for it.
pub fn ensure_running(host: Option<&str>, port: Option<&str>) -> Result<OllamaEndpoint, OllamaError> {
    if !has_command("ollama") {
        return Err(OllamaError::NotInstalled);
    }

    let (host, port) = local_endpoint(host, port);
    if is_serving(&host, &port) {
        println!("Local Ollama is already up at {host}:{port} and running, using it");
        return Ok(OllamaEndpoint { host, port });
    }

    println!("Local Ollama is not live, running ollama serve");
    let mut child = Command::new("ollama")
        .arg("serve")
        .env("OLLAMA_HOST", format!("{host}:{port}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(OllamaError::Spawn)?;
    let pid = child.id();
    info!(pid, "started ollama serve");

    for attempt in 1..=START_RETRIES {
        if is_serving(&host, &port) {
            println!("Local Ollama server is up at {host}:{port} and running with PID {pid}");
            return Ok(OllamaEndpoint { host, port });
        }
        println!("Waiting for the local Ollama server to start... (Attempt {attempt}/{START_RETRIES})");
        thread::sleep(START_RETRY_DELAY);
    }

    let _ = child.kill();
    let _ = child.wait();
    Err(OllamaError::NotReady(START_RETRIES))
}
