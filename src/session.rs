//! One acquisition session: calibrate, dump, watch for faults, tear down.

use std::{
    fmt,
    fs::File,
    io::{self, BufWriter},
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
    calibration::{CalibrationConfig, CalibrationResult, RateCalibrator},
    device::{DeviceError, DeviceHandle, Handler},
    flag::{RunFlag, StopCause},
    poller::{PollerConfig, PollerFault, PollerReport, RegisterPoller},
    sink::{Destination, SampleSink, SinkError, SinkStatus},
};

/// Length of an unbounded dump, used only when computing the byte budget.
pub const UNBOUNDED_HORIZON_SECS: f64 = 10.0 * 365.0 * 24.0 * 60.0 * 60.0;
pub const BYTES_PER_SAMPLE: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DumpDuration {
    Seconds(f64),
    Unbounded,
}

impl DumpDuration {
    pub fn is_zero(&self) -> bool {
        matches!(self, DumpDuration::Seconds(s) if *s == 0.0)
    }

    fn seconds(&self) -> f64 {
        match self {
            DumpDuration::Seconds(s) => *s,
            DumpDuration::Unbounded => UNBOUNDED_HORIZON_SECS,
        }
    }
}

impl FromStr for DumpDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "inf" {
            return Ok(DumpDuration::Unbounded);
        }
        match s.parse::<f64>() {
            Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => Ok(DumpDuration::Seconds(seconds)),
            _ => Err(format!("'{s}' is not a number of seconds or 'inf'")),
        }
    }
}

impl fmt::Display for DumpDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpDuration::Seconds(s) => write!(f, "{s} seconds"),
            DumpDuration::Unbounded => write!(f, "non-stop"),
        }
    }
}

/// Bytes to persist for `duration` at `rate` bytes per second. Saturates
/// instead of overflowing.
pub fn byte_budget(rate: f64, duration: DumpDuration) -> u64 {
    (rate * duration.seconds() * BYTES_PER_SAMPLE as f64) as u64
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub destination: Destination,
    pub duration: DumpDuration,
    /// Log the USB noise level measured during calibration.
    pub report_noise: bool,
    pub register_log: PathBuf,
    pub monitor_interval: Duration,
    pub calibration: CalibrationConfig,
    pub poller: PollerConfig,
}

impl SessionConfig {
    pub fn new(destination: Destination, duration: DumpDuration) -> Self {
        SessionConfig {
            destination,
            duration,
            report_noise: duration.is_zero(),
            register_log: PathBuf::from("regdump.txt"),
            monitor_interval: Duration::from_secs(2),
            calibration: CalibrationConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no data observed while calibrating")]
    NoDataObserved,

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("cannot create register log {path}: {source}")]
    RegisterLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start register poller: {0}")]
    Spawn(#[source] io::Error),

    #[error("stop because of file IO errors")]
    SinkIo,

    #[error("overflow detected on board ({overflows} since start), data loss is very likely")]
    Overflow { overflows: u32 },

    #[error(transparent)]
    Register(PollerFault),

    #[error("session stopped")]
    Stopped,

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The byte budget was written.
    Done,
    /// The operator stopped the session.
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    pub calibration: CalibrationResult,
    pub byte_budget: u64,
    pub overflows: u32,
    pub completion: Completion,
}

const PHASE_CALIBRATING: u8 = 0;
const PHASE_TESTING: u8 = 1;
const PHASE_DUMPING: u8 = 2;

/// Live numbers for the operator's status line.
#[derive(Debug, Default)]
pub struct SessionProgress {
    phase: AtomicU8,
    rate: AtomicU64,
    bytes_remaining: AtomicU64,
    overflows: AtomicU32,
}

impl SessionProgress {
    pub fn overflows(&self) -> u32 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining.load(Ordering::Relaxed)
    }
}

impl fmt::Display for SessionProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase.load(Ordering::Relaxed) {
            PHASE_CALIBRATING => return write!(f, "Determining sample rate..."),
            PHASE_DUMPING => {
                let rate = self.rate.load(Ordering::Relaxed).max(1);
                write!(f, "{} seconds to go. ", self.bytes_remaining() / (BYTES_PER_SAMPLE * rate))?;
            }
            _ => write!(f, "Just testing. Press Ctrl-C to exit. ")?,
        }
        write!(f, "Overflows count: {}", self.overflows())
    }
}

/// Mutable control state of a running session.
#[derive(Debug)]
pub struct SessionState {
    pub byte_budget: u64,
    pub overflow_baseline: u32,
    pub flag: Arc<RunFlag>,
    pub sink: Option<Arc<SampleSink>>,
}

/// Owns the device and everything attached to it for one session.
///
/// The register poller gets a clone of the device handle and only uses
/// register access; this type only uses streaming and debug snapshots.
pub struct AcquisitionSupervisor {
    config: SessionConfig,
    device: Option<Arc<dyn DeviceHandle>>,
    state: SessionState,
    progress: Arc<SessionProgress>,
    poller: Option<JoinHandle<PollerReport>>,
}

impl AcquisitionSupervisor {
    /// `device` must already be initialized.
    pub fn new(device: Arc<dyn DeviceHandle>, config: SessionConfig) -> Self {
        AcquisitionSupervisor {
            config,
            device: Some(device),
            state: SessionState {
                byte_budget: 0,
                overflow_baseline: 0,
                flag: Arc::new(RunFlag::new()),
                sink: None,
            },
            progress: Arc::new(SessionProgress::default()),
            poller: None,
        }
    }

    pub fn run_flag(&self) -> Arc<RunFlag> {
        self.state.flag.clone()
    }

    pub fn progress(&self) -> Arc<SessionProgress> {
        self.progress.clone()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run the session to completion. Resources are released before this returns,
    /// whatever the outcome.
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        let result = self.session();
        self.teardown();
        result
    }

    fn session(&mut self) -> Result<SessionReport, SessionError> {
        let device = self.device.clone().ok_or(SessionError::Stopped)?;

        info!(
            "determining sample rate{}",
            if self.config.report_noise { " and USB noise level" } else { "" }
        );
        let (calibration, last) = RateCalibrator::new(&*device, &self.config.calibration).run()?;
        let rate = calibration.rate_bytes_per_sec();
        info!("sample rate is ~{:.0} MHz", calibration.sample_rate_mhz());
        if self.config.report_noise {
            match calibration.noise_ratio() {
                Some(ratio) => info!("noise level is {ratio:.3} noisy packets per megabyte"),
                None => warn!("no data observed, noise level is unknown"),
            }
        }
        if !self.state.flag.sleep(self.config.calibration.post_settle) {
            // Stopped before anything was opened; leave the destination alone.
            return self.stop_outcome().map(|completion| SessionReport {
                calibration,
                byte_budget: 0,
                overflows: 0,
                completion,
            });
        }

        let budget = byte_budget(rate, self.config.duration);
        if budget == 0 && !self.config.duration.is_zero() {
            return Err(SessionError::NoDataObserved);
        }
        self.state.byte_budget = budget;
        self.state.overflow_baseline = last.overflows;
        self.progress.rate.store(rate as u64, Ordering::Relaxed);
        self.progress.bytes_remaining.store(budget, Ordering::Relaxed);

        self.attach_sink(&*device)?;
        self.start_poller(&device)?;
        let completion = self.monitor(&*device)?;

        Ok(SessionReport {
            calibration,
            byte_budget: budget,
            overflows: self.progress.overflows(),
            completion,
        })
    }

    fn attach_sink(&mut self, device: &dyn DeviceHandle) -> Result<(), SessionError> {
        if self.state.byte_budget == 0 {
            info!("start testing USB transfer");
            device.change_handler(None);
            self.progress.phase.store(PHASE_TESTING, Ordering::Relaxed);
            return Ok(());
        }

        info!(
            "start dumping {} bytes to {}",
            self.state.byte_budget, self.config.destination
        );
        let sink = Arc::new(SampleSink::create(
            &self.config.destination,
            self.state.byte_budget,
        )?);
        device.change_handler(Some(sink.clone() as Handler));
        self.state.sink = Some(sink);
        self.progress.phase.store(PHASE_DUMPING, Ordering::Relaxed);
        Ok(())
    }

    fn start_poller(&mut self, device: &Arc<dyn DeviceHandle>) -> Result<(), SessionError> {
        let path = &self.config.register_log;
        let log = File::create(path).map_err(|source| SessionError::RegisterLog {
            path: path.clone(),
            source,
        })?;
        let poller = RegisterPoller::new(
            device.clone(),
            self.state.flag.clone(),
            self.config.poller.clone(),
            BufWriter::new(log),
            Instant::now(),
        );
        self.poller = Some(poller.spawn().map_err(SessionError::Spawn)?);
        Ok(())
    }

    fn monitor(&self, device: &dyn DeviceHandle) -> Result<Completion, SessionError> {
        let flag = &self.state.flag;
        loop {
            if !flag.is_running() {
                return self.stop_outcome();
            }

            if let Some(sink) = &self.state.sink {
                self.progress
                    .bytes_remaining
                    .store(sink.bytes_remaining(), Ordering::Relaxed);
                match sink.status() {
                    SinkStatus::Done => return Ok(Completion::Done),
                    SinkStatus::Error => return Err(SessionError::SinkIo),
                    SinkStatus::Running => {}
                }
            }

            let snapshot = device.debug_snapshot(true)?;
            let overflows = snapshot.overflows.wrapping_sub(self.state.overflow_baseline);
            self.progress.overflows.store(overflows, Ordering::Relaxed);
            if snapshot.overflows_inc != 0 {
                return Err(SessionError::Overflow { overflows });
            }

            flag.sleep(self.config.monitor_interval);
        }
    }

    /// How the session ends once the run flag is down.
    fn stop_outcome(&self) -> Result<Completion, SessionError> {
        match self.state.flag.take_cause() {
            Some(StopCause::Interrupted) => Ok(Completion::Interrupted),
            Some(StopCause::Poller(fault)) => Err(SessionError::Register(fault)),
            None => Err(SessionError::Stopped),
        }
    }

    /// Release everything the session holds, in order. Safe to call more than once.
    pub fn teardown(&mut self) {
        if let Some(device) = &self.device {
            device.change_handler(None);
        }
        if let Some(sink) = self.state.sink.take() {
            sink.close();
        }

        self.state.flag.stop();
        if let Some(poller) = self.poller.take() {
            match poller.join() {
                Ok(report) => info!("register log has {} entries", report.entries),
                Err(_) => error!("register poller panicked"),
            }
        }

        if let Some(device) = self.device.take() {
            if let Err(e) = device.stop_streaming() {
                warn!("failed to stop streaming: {e}");
            }
            drop(device);
            info!("device released");
        }
    }
}

impl Drop for AcquisitionSupervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!("inf".parse(), Ok(DumpDuration::Unbounded));
        assert_eq!("60".parse(), Ok(DumpDuration::Seconds(60.0)));
        assert_eq!("0".parse::<DumpDuration>().map(|d| d.is_zero()), Ok(true));
        assert!("-1".parse::<DumpDuration>().is_err());
        assert!("NaN".parse::<DumpDuration>().is_err());
        assert!("forever".parse::<DumpDuration>().is_err());
    }

    #[test]
    fn zero_duration_has_zero_budget() {
        assert_eq!(byte_budget(53e6, DumpDuration::Seconds(0.0)), 0);
    }

    #[test]
    fn budget_is_rate_times_seconds() {
        assert_eq!(byte_budget(1000.0, DumpDuration::Seconds(2.5)), 2500);
    }

    #[test]
    fn unbounded_budget_outlasts_years() {
        let rate = 53.0 * 1_048_576.0;
        let budget = byte_budget(rate, DumpDuration::Unbounded);
        let years = budget as f64 / rate / (365.0 * 24.0 * 3600.0);
        assert!(years > 9.0, "only {years} years");
    }

    #[test]
    fn huge_rates_saturate() {
        assert_eq!(byte_budget(f64::MAX, DumpDuration::Unbounded), u64::MAX);
    }

    #[test]
    fn progress_line() {
        let progress = SessionProgress::default();
        assert_eq!(progress.to_string(), "Determining sample rate...");

        progress.phase.store(PHASE_TESTING, Ordering::Relaxed);
        progress.overflows.store(2, Ordering::Relaxed);
        assert_eq!(progress.to_string(), "Just testing. Press Ctrl-C to exit. Overflows count: 2");

        progress.phase.store(PHASE_DUMPING, Ordering::Relaxed);
        progress.rate.store(1000, Ordering::Relaxed);
        progress.bytes_remaining.store(5000, Ordering::Relaxed);
        assert_eq!(progress.to_string(), "5 seconds to go. Overflows count: 2");
    }
}
