//! Process capabilities used by the supervisor: spawn, liveness and graceful stop.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

/// Where the child's stdout/stderr go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Inherit,
    LogFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub envs: Vec<(String, String)>,
    pub output: Output,
}

/// A running child owned by the supervisor.
pub trait ManagedChild: Send {
    fn pid(&self) -> u32;

    /// Whether the process is still running. Reaps it if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Asks the process to exit, escalating after `grace`. Returns once it is gone.
    fn graceful_stop(&mut self, grace: Duration) -> anyhow::Result<()>;
}

pub trait ProcessLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn ManagedChild>>;
}

/// Real processes of the host OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessLauncher for SystemProcesses {
    fn spawn(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn ManagedChild>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .envs(spec.envs.iter().map(|(k, v)| (k, v)));

        match &spec.output {
            Output::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            Output::LogFile(path) => {
                let log = File::create(path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                let log_err = log
                    .try_clone()
                    .with_context(|| format!("duplicating log file handle {}", path.display()))?;
                cmd.stdout(log).stderr(log_err);
            }
        }

        // Own process group, so signals reach the node and whatever it spawns,
        // and a terminal Ctrl-C goes to the launcher only.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", spec.program.display()))?;
        info!(pid = child.id(), program = %spec.program.display(), "spawned process");

        Ok(Box::new(SystemChild { child }))
    }
}

struct SystemChild {
    child: Child,
}

impl ManagedChild for SystemChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = self.child.id(), %status, "process exited");
                false
            }
            Err(err) => {
                warn!(pid = self.child.id(), "could not query process status: {err}");
                true
            }
        }
    }

    #[cfg(unix)]
    fn graceful_stop(&mut self, grace: Duration) -> anyhow::Result<()> {
        const POLL: Duration = Duration::from_millis(500);

        if !self.is_alive() {
            return Ok(());
        }

        let pid = self.child.id();
        signal_group(pid, libc::SIGTERM).context("sending SIGTERM")?;
        info!(pid, "SIGTERM sent to process group");

        let deadline = std::time::Instant::now() + grace;
        while std::time::Instant::now() < deadline {
            if !self.is_alive() {
                info!(pid, "process group terminated");
                return Ok(());
            }
            std::thread::sleep(POLL);
        }

        warn!(pid, "process did not exit within {grace:?}, sending SIGKILL");
        signal_group(pid, libc::SIGKILL).context("sending SIGKILL")?;
        self.child
            .wait()
            .with_context(|| format!("waiting for process {pid} after SIGKILL"))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn graceful_stop(&mut self, _grace: Duration) -> anyhow::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        let pid = self.child.id();
        if let Err(err) = self.child.kill() {
            if err.kind() != io::ErrorKind::InvalidInput {
                return Err(err).with_context(|| format!("terminating process {pid}"));
            }
        }
        self.child
            .wait()
            .with_context(|| format!("waiting for process {pid} to exit"))?;
        info!(pid, "process terminated");
        Ok(())
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // group already gone
        return Ok(());
    }
    Err(err)
}

/// Raises the soft open-file limit towards `limit`, capped by the hard limit.
#[cfg(unix)]
pub fn raise_open_file_limit(limit: u64) -> io::Result<u64> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let target = (limit as libc::rlim_t).min(rlim.rlim_max);
    if rlim.rlim_cur >= target {
        return Ok(rlim.rlim_cur as u64);
    }
    rlim.rlim_cur = target;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(target as u64)
}

#[cfg(not(unix))]
pub fn raise_open_file_limit(limit: u64) -> io::Result<u64> {
    Ok(limit)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str], output: Output) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: std::env::temp_dir(),
            envs: vec![("DKN_TEST_VALUE".to_string(), "from-config".to_string())],
            output,
        }
    }

    #[test]
    fn stops_a_running_process_gracefully() {
        let mut child = SystemProcesses
            .spawn(&spec("sleep", &["30"], Output::Inherit))
            .unwrap();
        assert!(child.is_alive());

        child.graceful_stop(Duration::from_secs(5)).unwrap();
        assert!(!child.is_alive());
    }

    #[test]
    fn reports_exited_process_as_dead() {
        let mut child = SystemProcesses
            .spawn(&spec("true", &[], Output::Inherit))
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while child.is_alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!child.is_alive());
        child.graceful_stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn writes_output_and_env_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs.txt");
        let mut child = SystemProcesses
            .spawn(&spec(
                "sh",
                &["-c", "echo $DKN_TEST_VALUE"],
                Output::LogFile(log.clone()),
            ))
            .unwrap();
        while child.is_alive() {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "from-config");
    }

    #[test]
    fn spawn_of_missing_program_fails() {
        let result = SystemProcesses.spawn(&spec("/nonexistent/dkn-compute", &[], Output::Inherit));
        assert!(result.is_err());
    }

    #[test]
    fn open_file_limit_never_lowers() {
        let raised = raise_open_file_limit(64).unwrap();
        assert!(raised >= 64);
    }
}
