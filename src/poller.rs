//! Background harvesting of the frontend's per-channel status registers.

use std::{
    io::{self, Write},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
    device::{DeviceError, DeviceHandle},
    flag::RunFlag,
    regdump::{REGISTERS_PER_ENTRY, RegisterLogEntry},
};

/// Bit 0 of the control register starts a channel readout and reads back as busy.
const START_BIT: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub channels: u8,
    pub control_register: u8,
    pub status_registers: [u8; REGISTERS_PER_ENTRY - 1],
    pub busy_mask: u8,
    /// Value a status read returns when the frontend is not answering.
    pub fault_sentinel: u8,
    pub busy_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            channels: 4,
            control_register: 0x05,
            status_registers: [0x06, 0x07, 0x08, 0x09, 0x0a],
            busy_mask: 0x01,
            fault_sentinel: 0xff,
            busy_interval: Duration::from_micros(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerFault {
    #[error(
        "critical error while reading register {register:#04x} on channel {channel}, \
         is the device broken? Try to detach the submodule and attach it again"
    )]
    Sentinel { channel: u8, register: u8 },

    #[error("register access failed on channel {channel}: {source}")]
    Io {
        channel: u8,
        #[source]
        source: DeviceError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerReport {
    pub entries: u64,
    pub sweeps: u64,
}

pub struct RegisterPoller<W> {
    device: Arc<dyn DeviceHandle>,
    flag: Arc<RunFlag>,
    config: PollerConfig,
    log: W,
    log_broken: bool,
    started: Instant,
}

impl<W: Write + Send + 'static> RegisterPoller<W> {
    pub fn new(
        device: Arc<dyn DeviceHandle>,
        flag: Arc<RunFlag>,
        config: PollerConfig,
        log: W,
        started: Instant,
    ) -> Self {
        RegisterPoller {
            device,
            flag,
            config,
            log,
            log_broken: false,
            started,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<PollerReport>> {
        thread::Builder::new()
            .name("register-poller".to_string())
            .spawn(move || self.run())
    }

    /// Poll until the run flag is cleared or a channel faults.
    pub fn run(mut self) -> PollerReport {
        let mut report = PollerReport::default();

        'sweeps: while self.flag.is_running() {
            for channel in 0..self.config.channels {
                if !self.flag.is_running() {
                    break 'sweeps;
                }
                match self.poll_channel(channel) {
                    Ok(Some(entry)) => {
                        self.record(&entry);
                        report.entries += 1;
                    }
                    Ok(None) => break 'sweeps,
                    Err(fault) => {
                        error!("{fault}");
                        self.flag.fail(fault);
                        break 'sweeps;
                    }
                }
            }
            report.sweeps += 1;
            self.flush();
        }

        self.flush();
        info!(
            "register poller finished after {} sweeps ({} entries)",
            report.sweeps, report.entries
        );
        report
    }

    /// Select `channel`, wait for the readout, and collect its registers.
    /// `None` means the flag was cleared while waiting.
    fn poll_channel(&self, channel: u8) -> Result<Option<RegisterLogEntry>, PollerFault> {
        let cfg = &self.config;
        let io = |source: DeviceError| PollerFault::Io { channel, source };

        self.device
            .write_register(cfg.control_register, (channel << 4) | START_BIT)
            .map_err(io)?;

        let status = loop {
            thread::sleep(cfg.busy_interval);
            if !self.flag.is_running() {
                return Ok(None);
            }
            let value = self.device.read_register(cfg.control_register).map_err(io)?;
            if value == cfg.fault_sentinel {
                return Err(PollerFault::Sentinel {
                    channel,
                    register: cfg.control_register,
                });
            }
            if value & cfg.busy_mask == 0 {
                break value;
            }
        };

        let timestamp_ms = self.started.elapsed().as_millis() as u64;
        let mut values = [status; REGISTERS_PER_ENTRY];
        for (slot, register) in values[1..].iter_mut().zip(cfg.status_registers) {
            *slot = self.device.read_register(register).map_err(io)?;
        }

        Ok(Some(RegisterLogEntry {
            timestamp_ms,
            values,
        }))
    }

    fn record(&mut self, entry: &RegisterLogEntry) {
        if self.log_broken {
            return;
        }
        if let Err(e) = writeln!(self.log, "{entry}") {
            warn!("register log write failed, no further entries will be logged: {e}");
            self.log_broken = true;
        }
    }

    fn flush(&mut self) {
        if self.log_broken {
            return;
        }
        if let Err(e) = self.log.flush() {
            warn!("register log flush failed: {e}");
            self.log_broken = true;
        }
    }
}
