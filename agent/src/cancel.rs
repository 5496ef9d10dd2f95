//! Cancellation coordination between the build-execution thread and a
//! control thread.
//!
//! One coordinator is shared by a [`crate::session::BuildSession`] and any
//! number of cancel callers. The request flag is set once and read many
//! times; the phase moves Running -> CancelRequested -> Unwinding ->
//! Cancelled (or back to Idle on normal completion), and every transition
//! wakes waiters so `cancel()` can join an unwinding already in progress.

use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelPhase {
    Idle,
    Running,
    CancelRequested,
    Unwinding,
    Cancelled,
}

struct CancelState {
    phase: Mutex<CancelPhase>,
    changed: Condvar,
    requested: AtomicBool,
    // Currently running external process, parked here so cancel() can kill it.
    process: Mutex<Option<Child>>,
}

/// Cheaply cloneable handle shared between the interpreter and controllers.
#[derive(Clone)]
pub struct CancellationCoordinator {
    state: Arc<CancelState>,
}

impl Default for CancellationCoordinator {
    fn default() -> Self {
        CancellationCoordinator::new()
    }
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        CancellationCoordinator {
            state: Arc::new(CancelState {
                phase: Mutex::new(CancelPhase::Idle),
                changed: Condvar::new(),
                requested: AtomicBool::new(false),
                process: Mutex::new(None),
            }),
        }
    }

    /// Marks a build as running and clears any stale request.
    pub fn start(&self) {
        let mut phase = self.state.phase.lock().expect("phase lock");
        *phase = CancelPhase::Running;
        self.state.requested.store(false, Ordering::SeqCst);
        self.state.changed.notify_all();
    }

    /// True once a cancel has been requested for the running build.
    pub fn requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Called by the interpreter when it starts running onCancel chains.
    pub fn begin_unwinding(&self) {
        let mut phase = self.state.phase.lock().expect("phase lock");
        *phase = CancelPhase::Unwinding;
        self.state.changed.notify_all();
    }

    /// Called by the interpreter when `execute` returns.
    pub fn finish(&self, cancelled: bool) {
        let mut phase = self.state.phase.lock().expect("phase lock");
        *phase = if cancelled {
            CancelPhase::Cancelled
        } else {
            CancelPhase::Idle
        };
        self.state.changed.notify_all();
    }

    pub fn phase(&self) -> CancelPhase {
        *self.state.phase.lock().expect("phase lock")
    }

    /// True while a cancel is pending and unwinding has not started yet.
    /// onCancel handlers run after `begin_unwinding`, so their processes
    /// must not be killed on this condition.
    pub fn interrupt_pending(&self) -> bool {
        self.phase() == CancelPhase::CancelRequested
    }

    /// Requests cancellation and blocks until unwinding completes or
    /// `timeout` elapses, returning whether it completed in time.
    ///
    /// Idempotent and joinable: concurrent callers all wait for the same
    /// unwinding. Returns true immediately when no build is running.
    pub fn cancel(&self, timeout: Duration) -> bool {
        let kill = {
            let mut phase = self.state.phase.lock().expect("phase lock");
            match *phase {
                CancelPhase::Idle | CancelPhase::Cancelled => return true,
                CancelPhase::Running => {
                    *phase = CancelPhase::CancelRequested;
                }
                CancelPhase::CancelRequested | CancelPhase::Unwinding => {}
            }
            self.state.requested.store(true, Ordering::SeqCst);
            self.state.changed.notify_all();
            // A parked process during Unwinding belongs to an onCancel
            // handler; leave it alone.
            *phase == CancelPhase::CancelRequested
        };
        if kill {
            debug!("cancel requested, terminating current process if any");
            self.kill_current_process();
        }

        let deadline = Instant::now() + timeout;
        let mut phase = self.state.phase.lock().expect("phase lock");
        loop {
            match *phase {
                CancelPhase::Idle | CancelPhase::Cancelled => return true,
                _ => {}
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    warn!("cancel timed out waiting for unwinding");
                    return false;
                }
            };
            let (guard, _) = self
                .state
                .changed
                .wait_timeout(phase, remaining)
                .expect("phase wait");
            phase = guard;
        }
    }

    /// Parks the running external process so a cancel can terminate it.
    pub fn register_process(&self, child: Child) {
        let mut slot = self.state.process.lock().expect("process lock");
        // A second registration while one is parked would leak the first;
        // callers run processes strictly one at a time.
        debug_assert!(slot.is_none());
        *slot = Some(child);
        if self.interrupt_pending() {
            drop(slot);
            self.kill_current_process();
        }
    }

    /// Non-blocking reap of the parked process.
    pub fn poll_process(&self) -> Result<Option<ExitStatus>> {
        let mut slot = self.state.process.lock().expect("process lock");
        match slot.as_mut() {
            Some(child) => child.try_wait().context("poll child process"),
            None => Ok(None),
        }
    }

    /// Removes the parked process once it has been reaped.
    pub fn clear_process(&self) -> Option<Child> {
        self.state.process.lock().expect("process lock").take()
    }

    fn kill_current_process(&self) {
        let mut slot = self.state.process.lock().expect("process lock");
        if let Some(child) = slot.as_mut() {
            // The runner spawns the child as its own process group leader;
            // signalling the group also reaches anything the command forked,
            // which closes the output pipes and lets the readers finish.
            if !kill_process_group(child) {
                if let Err(err) = child.kill() {
                    warn!(err = %err, "failed to kill build process");
                }
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return false;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => true,
        Err(err) => {
            warn!(err = %err, "failed to kill build process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_when_idle_returns_immediately() {
        let coordinator = CancellationCoordinator::new();
        assert!(coordinator.cancel(Duration::from_millis(10)));
    }

    #[test]
    fn cancel_times_out_when_build_never_unwinds() {
        let coordinator = CancellationCoordinator::new();
        coordinator.start();
        assert!(!coordinator.cancel(Duration::from_millis(50)));
        assert!(coordinator.requested());
    }

    #[test]
    fn concurrent_cancels_join_the_same_unwinding() {
        let coordinator = CancellationCoordinator::new();
        coordinator.start();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let coordinator = coordinator.clone();
                thread::spawn(move || coordinator.cancel(Duration::from_secs(5)))
            })
            .collect();

        // Simulate the build thread noticing the request and unwinding.
        while !coordinator.requested() {
            thread::sleep(Duration::from_millis(1));
        }
        coordinator.begin_unwinding();
        coordinator.finish(true);

        for waiter in waiters {
            assert!(waiter.join().expect("join cancel thread"));
        }
        assert_eq!(coordinator.phase(), CancelPhase::Cancelled);
    }

    #[test]
    fn a_process_registered_while_unwinding_is_left_running() {
        let coordinator = CancellationCoordinator::new();
        coordinator.start();
        assert!(!coordinator.cancel(Duration::from_millis(10)));
        coordinator.begin_unwinding();

        // Stands in for an onCancel handler's cleanup command; it must be
        // allowed to finish even though the request flag is still set.
        let child = std::process::Command::new("/bin/sh")
            .args(["-c", "sleep 0.2; exit 0"])
            .spawn()
            .expect("spawn cleanup command");
        coordinator.register_process(child);

        let status = loop {
            match coordinator.poll_process().expect("poll") {
                Some(status) => break status,
                None => thread::sleep(Duration::from_millis(10)),
            }
        };
        coordinator.clear_process();
        assert_eq!(status.code(), Some(0));
    }

    #[test]
    fn start_clears_a_stale_request() {
        let coordinator = CancellationCoordinator::new();
        coordinator.start();
        assert!(!coordinator.cancel(Duration::from_millis(10)));
        coordinator.finish(true);
        coordinator.start();
        assert!(!coordinator.requested());
    }
}
