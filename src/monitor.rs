use std::io;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::platform::ManagedChild;
use crate::supervisor::SupervisorEvent;

pub type SharedChild = Arc<Mutex<Box<dyn ManagedChild>>>;

pub(crate) fn lock_child(child: &SharedChild) -> MutexGuard<'_, Box<dyn ManagedChild>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cooperative cancellation flag that also wakes sleepers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for up to `timeout`. Returns `true` as soon as the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = condvar
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Liveness loop for one child generation.
///
/// Reports [`SupervisorEvent::ChildExited`] once if the child dies while the
/// monitor is not cancelled. Dropping the monitor cancels it and joins the thread.
pub struct LivenessMonitor {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl LivenessMonitor {
    pub fn spawn(
        child: SharedChild,
        generation: u64,
        interval: Duration,
        events: Sender<SupervisorEvent>,
    ) -> io::Result<Self> {
        let token = CancellationToken::new();
        let thread_token = token.clone();

        let handle = thread::Builder::new()
            .name(format!("liveness-{generation}"))
            .spawn(move || watch(child, generation, interval, thread_token, events))?;

        Ok(Self {
            token,
            handle: Some(handle),
            generation,
        })
    }

    /// Signals cancellation and waits for the thread to observe it.
    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(generation = self.generation, "liveness monitor panicked");
            }
            debug!(generation = self.generation, "liveness monitor stopped");
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch(
    child: SharedChild,
    generation: u64,
    interval: Duration,
    token: CancellationToken,
    events: Sender<SupervisorEvent>,
) {
    loop {
        if token.wait_timeout(interval) {
            return;
        }

        let mut guard = lock_child(&child);
        if guard.is_alive() {
            continue;
        }
        // An update may have cancelled us while we were probing.
        if token.is_cancelled() {
            return;
        }
        let pid = guard.pid();
        drop(guard);

        debug!(generation, pid, "child process is gone");
        let _ = events.send(SupervisorEvent::ChildExited { generation, pid });
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    struct FlagChild(Arc<AtomicBool>);

    impl ManagedChild for FlagChild {
        fn pid(&self) -> u32 {
            7
        }

        fn is_alive(&mut self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn graceful_stop(&mut self, _grace: Duration) -> anyhow::Result<()> {
            self.0.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn shared(alive: &Arc<AtomicBool>) -> SharedChild {
        Arc::new(Mutex::new(Box::new(FlagChild(alive.clone()))))
    }

    #[test]
    fn wait_timeout_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let started = Instant::now();
        let waiter = thread::spawn(move || remote.wait_timeout(Duration::from_secs(30)));

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(token.is_cancelled());
    }

    #[test]
    fn wait_timeout_expires_without_cancel() {
        let token = CancellationToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn reports_dead_child_once() {
        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let monitor =
            LivenessMonitor::spawn(shared(&alive), 3, Duration::from_millis(10), tx).unwrap();

        alive.store(false, Ordering::SeqCst);
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, SupervisorEvent::ChildExited { generation: 3, pid: 7 });

        monitor.cancel();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancelled_monitor_ignores_a_later_stop() {
        let alive = Arc::new(AtomicBool::new(true));
        let child = shared(&alive);
        let (tx, rx) = mpsc::channel();
        let monitor =
            LivenessMonitor::spawn(child.clone(), 1, Duration::from_millis(10), tx).unwrap();

        thread::sleep(Duration::from_millis(30));
        monitor.cancel();
        lock_child(&child).graceful_stop(Duration::ZERO).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }
}
