//! Acquisition control for nut4nt (FX3 + NT1065) capture boards.
//!
//! [`session::AcquisitionSupervisor`] drives a session: it calibrates the
//! data rate, dumps a byte budget through a [`sink::SampleSink`], harvests
//! frontend registers with a [`poller::RegisterPoller`] and aborts on board
//! overflows.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod calibration;
pub mod config;
pub mod device;
pub mod flag;
pub mod fx3_programmer;
pub mod fx3dev;
pub mod poller;
pub mod regdump;
pub mod session;
pub mod sink;

/// Lock `mutex`, ignoring poisoning: every guarded value stays consistent
/// between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
