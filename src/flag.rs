//! Session-wide cancellation token.

use std::{
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{lock, poller::PollerFault};

/// Why a session stopped running.
#[derive(Debug)]
pub enum StopCause {
    /// The operator asked to stop.
    Interrupted,
    /// The register poller hit a hardware fault.
    Poller(PollerFault),
}

/// Starts out running and can be stopped exactly once. Only a cause given by
/// the stop that clears the flag is kept.
#[derive(Debug)]
pub struct RunFlag {
    running: AtomicBool,
    cause: Mutex<Option<StopCause>>,
    gate: Mutex<()>,
    stopped: Condvar,
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    pub fn new() -> Self {
        RunFlag {
            running: AtomicBool::new(true),
            cause: Mutex::new(None),
            gate: Mutex::new(()),
            stopped: Condvar::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the flag without a cause. Idempotent.
    pub fn stop(&self) {
        let _gate = lock(&self.gate);
        self.running.store(false, Ordering::Release);
        self.stopped.notify_all();
    }

    fn stop_with(&self, cause: StopCause) {
        {
            let mut slot = lock(&self.cause);
            if slot.is_none() && self.is_running() {
                *slot = Some(cause);
            }
        }
        self.stop();
    }

    pub fn interrupt(&self) {
        self.stop_with(StopCause::Interrupted);
    }

    pub fn fail(&self, fault: PollerFault) {
        self.stop_with(StopCause::Poller(fault));
    }

    /// Take the recorded cause, if the flag was stopped with one.
    pub fn take_cause(&self) -> Option<StopCause> {
        lock(&self.cause).take()
    }

    /// Sleep up to `timeout`, waking early if the flag is cleared. Returns
    /// whether the flag is still set.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = lock(&self.gate);
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            gate = match self.stopped.wait_timeout(gate, deadline - now) {
                Ok((gate, _)) => gate,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.is_running()
    }
}
