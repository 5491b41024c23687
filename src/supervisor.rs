//! Runs the compute node and keeps it on the newest release.
//!
//! States: STARTING -> RUNNING -> (UPDATING | CRASHED | STOPPED). UPDATING
//! always goes back to STARTING with a fresh child and a fresh liveness
//! monitor. The update check runs on this thread; the liveness check runs on a
//! [`LivenessMonitor`] thread that is cancelled and joined before the child it
//! watches is stopped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::env_store::{self, COMPUTE_VERSION_KEY, Config};
use crate::installer::make_executable;
use crate::monitor::{LivenessMonitor, SharedChild, lock_child};
use crate::platform::{LaunchSpec, Output, ProcessLauncher};

/// Messages delivered to the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The child of `generation` was observed dead by its liveness monitor.
    ChildExited { generation: u64, pid: u32 },
    /// The user asked the launcher to shut down.
    Interrupted,
}

/// Source of new compute node versions.
pub trait ReleaseFeed {
    fn newest_version(&self) -> anyhow::Result<String>;

    /// Downloads `version` to `dest` without making it executable and returns
    /// the version actually written.
    fn download(&self, version: &str, dest: &Path) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Foreground,
    Background,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub mode: RunMode,
    pub working_dir: PathBuf,
    pub binary_name: String,
    pub liveness_interval: Duration,
    pub update_interval: Duration,
    pub stop_grace: Duration,
    /// Logs a line on every update check that finds nothing new.
    pub verbose_updates: bool,
}

impl SupervisorOptions {
    pub fn new(mode: RunMode, working_dir: PathBuf, binary_name: impl Into<String>) -> Self {
        Self {
            mode,
            working_dir,
            binary_name: binary_name.into(),
            liveness_interval: Duration::from_secs(5),
            update_interval: Duration::from_secs(60 * 60),
            stop_grace: Duration::from_secs(10),
            verbose_updates: false,
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        self.working_dir.join(&self.binary_name)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.working_dir.join(format!("temp-{}", self.binary_name))
    }

    pub fn log_path(&self) -> PathBuf {
        self.working_dir.join("logs.txt")
    }

    pub fn env_path(&self) -> PathBuf {
        self.working_dir.join(".env")
    }
}

/// How a supervisor run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Background mode: the child was started and left running.
    Detached { pid: u32, log_file: PathBuf },
    /// The child ended on its own.
    ChildExited { pid: u32 },
    /// The user interrupted the launcher; the child was stopped.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("starting {path}: {source:#}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("starting liveness monitor: {0}")]
    Monitor(#[source] io::Error),
    #[error("stopping compute node (pid {pid}): {source:#}")]
    Stop {
        pid: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("deleting old binary {path}: {source}")]
    DeleteBinary {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("renaming {from} to {to}: {source}")]
    RenameBinary {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("preparing new binary: {0}")]
    Prepare(#[source] crate::installer::InstallError),
}

/// A started child together with the monitor watching it.
struct Running {
    child: SharedChild,
    pid: u32,
    generation: u64,
    monitor: LivenessMonitor,
}

/// What ended a RUNNING phase.
enum Transition {
    Update { version: String },
    Crashed { pid: u32 },
    Interrupted,
}

pub struct Supervisor<L, F> {
    launcher: L,
    feed: F,
    config: Config,
    options: SupervisorOptions,
    events_tx: Sender<SupervisorEvent>,
    events_rx: Receiver<SupervisorEvent>,
    generation: u64,
}

impl<L: ProcessLauncher, F: ReleaseFeed> Supervisor<L, F> {
    pub fn new(launcher: L, feed: F, config: Config, options: SupervisorOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            launcher,
            feed,
            config,
            options,
            events_tx,
            events_rx,
            generation: 0,
        }
    }

    /// Sender for external events such as Ctrl-C.
    pub fn events(&self) -> Sender<SupervisorEvent> {
        self.events_tx.clone()
    }

    pub fn run(mut self) -> Result<SupervisorExit, SupervisorError> {
        loop {
            let (child, pid) = self.start()?;

            if self.options.mode == RunMode::Background {
                return Ok(SupervisorExit::Detached {
                    pid,
                    log_file: self.options.log_path(),
                });
            }

            let running = self.monitor(child, pid)?;
            match self.watch(running.generation) {
                Transition::Update { version } => self.replace(running, &version)?,
                Transition::Crashed { pid } => {
                    running.monitor.cancel();
                    info!(pid, "compute node exited, quitting launcher");
                    return Ok(SupervisorExit::ChildExited { pid });
                }
                Transition::Interrupted => {
                    self.stop(running)?;
                    return Ok(SupervisorExit::Interrupted);
                }
            }
        }
    }

    // STARTING
    fn start(&mut self) -> Result<(SharedChild, u32), SupervisorError> {
        let program = self.options.binary_path();
        let output = match self.options.mode {
            RunMode::Foreground => Output::Inherit,
            RunMode::Background => Output::LogFile(self.options.log_path()),
        };
        let spec = LaunchSpec {
            program: program.clone(),
            args: Vec::new(),
            working_dir: self.options.working_dir.clone(),
            envs: self
                .config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            output,
        };

        let child = self
            .launcher
            .spawn(&spec)
            .map_err(|source| SupervisorError::Spawn {
                path: program,
                source,
            })?;
        let pid = child.pid();
        self.generation += 1;
        info!(pid, generation = self.generation, "compute node started");

        Ok((Arc::new(Mutex::new(child)), pid))
    }

    // RUNNING: liveness half
    fn monitor(&mut self, child: SharedChild, pid: u32) -> Result<Running, SupervisorError> {
        let monitor = LivenessMonitor::spawn(
            child.clone(),
            self.generation,
            self.options.liveness_interval,
            self.events_tx.clone(),
        )
        .map_err(SupervisorError::Monitor)?;

        Ok(Running {
            child,
            pid,
            generation: self.generation,
            monitor,
        })
    }

    // RUNNING: update half. Returns when an update is staged, the child died,
    // or the user interrupted.
    fn watch(&mut self, generation: u64) -> Transition {
        let mut next_check = Instant::now() + self.options.update_interval;

        loop {
            let timeout = next_check.saturating_duration_since(Instant::now());
            match self.events_rx.recv_timeout(timeout) {
                Ok(SupervisorEvent::Interrupted) => return Transition::Interrupted,
                Ok(SupervisorEvent::ChildExited { generation: g, pid }) if g == generation => {
                    return Transition::Crashed { pid };
                }
                Ok(SupervisorEvent::ChildExited { generation: g, .. }) => {
                    debug!(stale = g, current = generation, "ignoring exit of a replaced child");
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(version) = self.check_for_update() {
                        return Transition::Update { version };
                    }
                    next_check = Instant::now() + self.options.update_interval;
                }
                Err(RecvTimeoutError::Disconnected) => unreachable!("supervisor owns a sender"),
            }
        }
    }

    /// Resolves the newest version and stages it next to the live binary.
    /// Any failure leaves the current node running until the next tick.
    fn check_for_update(&mut self) -> Option<String> {
        let current = self.config.get(COMPUTE_VERSION_KEY).unwrap_or_default();
        let newest = match self.feed.newest_version() {
            Ok(version) => version,
            Err(err) => {
                warn!("could not check for a new compute node version: {err:#}");
                return None;
            }
        };

        if newest == current {
            if self.options.verbose_updates {
                let next = chrono::Local::now()
                    + chrono::Duration::from_std(self.options.update_interval)
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                info!(
                    "No new compute node version detected, will check again at {}",
                    next.format("%H:%M:%S")
                );
            }
            return None;
        }

        info!(%current, %newest, "new compute node version detected, downloading it");
        let staging = self.options.staging_path();
        match self.feed.download(&newest, &staging) {
            Ok(installed) if installed == current => {
                info!(%installed, "fell back to the running version, keeping the current node");
                let _ = fs::remove_file(&staging);
                None
            }
            Ok(installed) => Some(installed),
            Err(err) => {
                warn!(
                    "downloading compute node {newest} failed, keeping the current version until the next check: {err:#}"
                );
                let _ = fs::remove_file(&staging);
                None
            }
        }
    }

    // UPDATING: the new binary is already staged.
    fn replace(&mut self, running: Running, version: &str) -> Result<(), SupervisorError> {
        info!("new version downloaded, stopping the running node");
        self.stop(running)?;

        let binary = self.options.binary_path();
        let staging = self.options.staging_path();
        match fs::remove_file(&binary) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SupervisorError::DeleteBinary {
                    path: binary,
                    source,
                });
            }
        }
        fs::rename(&staging, &binary).map_err(|source| SupervisorError::RenameBinary {
            from: staging,
            to: binary.clone(),
            source,
        })?;
        make_executable(&binary).map_err(SupervisorError::Prepare)?;

        self.config.set(COMPUTE_VERSION_KEY, version);
        if let Err(err) = env_store::persist(&self.config, &self.options.env_path()) {
            warn!("failed to save the new version to the env file: {err}");
        }

        info!(%version, "binary replaced, restarting the node");
        Ok(())
    }

    /// Cancels the monitor first so the stop is not mistaken for a crash.
    fn stop(&self, running: Running) -> Result<(), SupervisorError> {
        let Running {
            child,
            pid,
            monitor,
            ..
        } = running;
        monitor.cancel();

        lock_child(&child)
            .graceful_stop(self.options.stop_grace)
            .map_err(|source| SupervisorError::Stop { pid, source })?;
        info!(pid, "compute node stopped");
        Ok(())
    }
}
