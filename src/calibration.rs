//! Stream warm-up and data rate estimation.
//!
//! Right after init the board's first streaming start is unreliable, so the
//! stream is started, briefly run, restarted and left to settle before
//! anything is measured. The delays below were found empirically on nut4nt
//! boards.

use std::{thread, time::Duration};

use log::{debug, info};

use crate::device::{BYTES_PER_MB, DebugSnapshot, DeviceError, DeviceHandle};

#[derive(Debug, Clone)]
pub struct WarmupTiming {
    /// Pause after init before the first start.
    pub initial_settle: Duration,
    /// How long the first (probe) stream is left running.
    pub probe_run: Duration,
    /// Pause between stopping the probe stream and restarting.
    pub probe_pause: Duration,
    /// Pause after the restart before measuring.
    pub steady_settle: Duration,
}

impl Default for WarmupTiming {
    fn default() -> Self {
        WarmupTiming {
            initial_settle: Duration::from_millis(1000),
            probe_run: Duration::from_millis(100),
            probe_pause: Duration::from_millis(100),
            steady_settle: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub warmup: WarmupTiming,
    pub cadence: Duration,
    pub iterations: u32,
    /// Pause between the measurement and the start of the dump.
    pub post_settle: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            warmup: WarmupTiming::default(),
            cadence: Duration::from_millis(200),
            iterations: 5,
            post_settle: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    ColdStart,
    ProbeRestart,
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationResult {
    pub megabytes: f64,
    pub phy_errors: u64,
    pub window: Duration,
}

impl CalibrationResult {
    /// Effective data rate in bytes per second; zero if nothing was observed.
    pub fn rate_bytes_per_sec(&self) -> f64 {
        let seconds = self.window.as_secs_f64();
        if seconds <= 0.0 || self.megabytes <= 0.0 {
            return 0.0;
        }
        self.megabytes * BYTES_PER_MB / seconds
    }

    /// Samples are one byte wide.
    pub fn sample_rate_mhz(&self) -> f64 {
        self.rate_bytes_per_sec() / 1e6
    }

    /// Physical-layer errors per megabyte, `None` if no data was observed.
    pub fn noise_ratio(&self) -> Option<f64> {
        (self.megabytes > 0.0).then(|| self.phy_errors as f64 / self.megabytes)
    }
}

pub struct RateCalibrator<'a> {
    device: &'a dyn DeviceHandle,
    config: &'a CalibrationConfig,
    phase: StreamPhase,
}

impl<'a> RateCalibrator<'a> {
    pub fn new(device: &'a dyn DeviceHandle, config: &'a CalibrationConfig) -> Self {
        RateCalibrator {
            device,
            config,
            phase: StreamPhase::ColdStart,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// Move to the next warm-up phase. `Steady` is terminal.
    pub fn advance(&mut self) -> Result<StreamPhase, DeviceError> {
        let timing = &self.config.warmup;
        self.phase = match self.phase {
            StreamPhase::ColdStart => {
                thread::sleep(timing.initial_settle);
                self.device.start_streaming(None)?;
                thread::sleep(timing.probe_run);
                StreamPhase::ProbeRestart
            }
            StreamPhase::ProbeRestart => {
                self.device.stop_streaming()?;
                thread::sleep(timing.probe_pause);
                self.device.start_streaming(None)?;
                thread::sleep(timing.steady_settle);
                StreamPhase::Steady
            }
            StreamPhase::Steady => StreamPhase::Steady,
        };
        debug!("stream warm-up phase: {:?}", self.phase);
        Ok(self.phase)
    }

    pub fn warm_up(&mut self) -> Result<(), DeviceError> {
        while self.phase != StreamPhase::Steady {
            self.advance()?;
        }
        Ok(())
    }

    /// Sample the counters over a fixed window. The stream must be running
    /// without a handler. Returns the result and the last snapshot taken.
    pub fn measure(&self) -> Result<(CalibrationResult, DebugSnapshot), DeviceError> {
        let mut last = self.device.debug_snapshot(true)?;
        let mut megabytes = 0.0;
        let mut phy_errors = 0u64;

        for i in 0..self.config.iterations {
            thread::sleep(self.config.cadence);
            last = self.device.debug_snapshot(true)?;
            debug!(
                "calibration {}/{}: {:.3} MB, {} phy errors",
                i + 1,
                self.config.iterations,
                last.size_tx_mb_inc,
                last.phy_errors_inc
            );
            megabytes += last.size_tx_mb_inc;
            phy_errors += u64::from(last.phy_errors_inc);
        }

        let result = CalibrationResult {
            megabytes,
            phy_errors,
            window: self.config.cadence * self.config.iterations,
        };
        info!(
            "observed {:.2} MB in {:.2} s",
            result.megabytes,
            result.window.as_secs_f64()
        );
        Ok((result, last))
    }

    pub fn run(mut self) -> Result<(CalibrationResult, DebugSnapshot), DeviceError> {
        self.warm_up()?;
        self.measure()
    }
}
