use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::prompt::Prompter;

pub const COMPUTE_VERSION_KEY: &str = "DKN_COMPUTE_VERSION";
pub const MODELS_KEY: &str = "DKN_MODELS";
pub const WALLET_SECRET_KEY: &str = "DKN_WALLET_SECRET_KEY";
pub const ADMIN_PUBLIC_KEY: &str = "DKN_ADMIN_PUBLIC_KEY";
pub const LOG_LEVEL_KEY: &str = "RUST_LOG";
pub const OLLAMA_HOST_KEY: &str = "OLLAMA_HOST";
pub const OLLAMA_PORT_KEY: &str = "OLLAMA_PORT";
pub const JINA_API_KEY: &str = "JINA_API_KEY";
pub const SERPER_API_KEY: &str = "SERPER_API_KEY";

/// Remote copy of the compute node's example env file.
pub const ENV_TEMPLATE_URL: &str =
    "https://raw.githubusercontent.com/firstbatchxyz/dkn-compute-node/master/.env.example";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("env file not found at {0}")]
    NotFound(PathBuf),
    #[error("reading env file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("writing env file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fetching env template from {url}: {message}")]
    Template { url: String, message: String },
    #[error("reading input for {key}: {source}")]
    Input {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    InvalidSecretKey(String),
}

/// Flat key/value configuration shared with the compute node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    /// Value of `key`, treating empty strings as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn is_missing(&self, key: &str) -> bool {
        self.get(key).is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Renders the file form: one `KEY=value` per line, empty values dropped.
    /// Values that dotenvy would not read back verbatim are double-quoted.
    pub fn to_env_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.values.iter().filter(|(_, v)| !v.is_empty()) {
            out.push_str(key);
            out.push('=');
            out.push_str(&quote_value(value));
            out.push('\n');
        }
        out
    }
}

fn quote_value(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_.,:/@+=%~".contains(c));
    if plain {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Config {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

pub fn load(path: &Path) -> Result<Config, EnvError> {
    if !path.is_file() {
        return Err(EnvError::NotFound(path.to_path_buf()));
    }

    let parse_err = |source| EnvError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let mut config = Config::default();
    for item in dotenvy::from_path_iter(path).map_err(parse_err)? {
        let (key, value) = item.map_err(parse_err)?;
        config.set(key, value);
    }

    debug!(path = %path.display(), keys = config.len(), "loaded env file");
    Ok(config)
}

pub fn persist(config: &Config, path: &Path) -> Result<(), EnvError> {
    fs::write(path, config.to_env_string()).map_err(|source| EnvError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "saved env file");
    Ok(())
}

/// Loads `.env` from `dir`, falling back to `.env.example` and finally to the
/// remote template, which is saved as `.env`.
pub fn load_or_fetch(dir: &Path, template_url: &str) -> Result<Config, EnvError> {
    let env_path = dir.join(".env");
    match load(&env_path) {
        Ok(config) => {
            println!("Loaded {} as env\n", env_path.display());
            return Ok(config);
        }
        Err(EnvError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }

    let example_path = dir.join(".env.example");
    match load(&example_path) {
        Ok(config) => {
            println!("Loaded {} as base env\n", example_path.display());
            return Ok(config);
        }
        Err(EnvError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }

    println!("Couldn't find .env or .env.example, fetching the template from {template_url}\n");
    fetch_template(template_url, &env_path)?;
    load(&env_path)
}

fn fetch_template(url: &str, dest: &Path) -> Result<(), EnvError> {
    let template_err = |message: String| EnvError::Template {
        url: url.to_string(),
        message,
    };

    let response = reqwest::blocking::get(url).map_err(|err| template_err(err.to_string()))?;
    if !response.status().is_success() {
        return Err(template_err(format!("status {}", response.status())));
    }
    let body = response
        .text()
        .map_err(|err| template_err(err.to_string()))?;

    fs::write(dest, body).map_err(|source| EnvError::Write {
        path: dest.to_path_buf(),
        source,
    })
}

/// Defaults for required keys that are not secrets.
#[derive(Debug, Clone)]
pub struct RequiredDefaults {
    pub admin_public_key: String,
}

/// Fills missing mandatory keys. Returns whether the config changed.
pub fn ensure_required(
    config: &mut Config,
    defaults: &RequiredDefaults,
    prompter: &mut dyn Prompter,
) -> Result<bool, EnvError> {
    let mut changed = false;

    if config.is_missing(WALLET_SECRET_KEY) {
        println!("{WALLET_SECRET_KEY} is not set, getting it interactively");
        let answer = prompter
            .ask("Please enter your DKN Wallet Secret Key (32-bytes hex encoded)")
            .map_err(|source| EnvError::Input {
                key: WALLET_SECRET_KEY.to_string(),
                source,
            })?;
        let secret = parse_secret_key(&answer)?;
        config.set(WALLET_SECRET_KEY, secret);
        changed = true;
    }

    if config.is_missing(ADMIN_PUBLIC_KEY) {
        config.set(ADMIN_PUBLIC_KEY, defaults.admin_public_key.clone());
        changed = true;
    }

    Ok(changed)
}

/// Validates a wallet secret key and returns it without the `0x` prefix.
pub fn parse_secret_key(raw: &str) -> Result<String, EnvError> {
    let trimmed = raw.trim();
    let key = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if !key.chars().all(|c| c.is_ascii_hexdigit()) || key.len() % 2 != 0 {
        return Err(EnvError::InvalidSecretKey(
            "DKN Wallet Secret Key should be 32-bytes hex encoded".to_string(),
        ));
    }
    if key.len() != 64 {
        return Err(EnvError::InvalidSecretKey(
            "DKN Wallet Secret Key should be 32 bytes long".to_string(),
        ));
    }
    Ok(key.to_string())
}
