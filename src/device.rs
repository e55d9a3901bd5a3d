//! The capture board as seen by the rest of the crate.
//!
//! A session shares one [`DeviceHandle`] between the supervisor and the
//! register poller. The poller only touches [`DeviceHandle::write_register`]
//! and [`DeviceHandle::read_register`]; the supervisor only touches the
//! streaming and snapshot calls. Implementations must still keep every method
//! safe to call from either thread.

use std::{path::Path, str::FromStr, sync::Arc};

use crate::{config::ConfigError, fx3_programmer::FirmwareError, fx3dev::Fx3Device};

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no fx3 device found")]
    NoDevice,

    #[error("device is not initialized")]
    NotInitialized,

    #[error("streaming is already running")]
    AlreadyStreaming,

    #[error("invalid response to {0}")]
    InvalidResponse(&'static str),

    #[error("firmware error: {0}")]
    Firmware(#[from] FirmwareError),

    #[error("frontend config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("usb control transfer error: {0}")]
    UsbTransfer(#[from] nusb::transfer::TransferError),
}

/// Receives raw sample buffers from the streaming thread.
pub trait SampleHandler: Send + Sync {
    fn on_samples(&self, data: &[u8]);
}

pub type Handler = Arc<dyn SampleHandler>;

pub trait DeviceHandle: Send + Sync {
    /// Upload firmware and apply the frontend register configuration.
    fn init(&self, firmware: &Path, channel_config: &Path) -> Result<(), DeviceError>;

    fn start_streaming(&self, handler: Option<Handler>) -> Result<(), DeviceError>;

    fn stop_streaming(&self) -> Result<(), DeviceError>;

    /// Swap the streaming handler. Once this returns, the previous handler is
    /// not running and will not be called again.
    fn change_handler(&self, handler: Option<Handler>);

    fn write_register(&self, address: u8, value: u8) -> Result<(), DeviceError>;

    fn read_register(&self, address: u8) -> Result<u8, DeviceError>;

    /// Read the transfer and fault counters. A latching read advances the
    /// baseline the incremental fields are computed against.
    fn debug_snapshot(&self, latch: bool) -> Result<DebugSnapshot, DeviceError>;
}

/// Counters pulled from the board, cumulative and since the last latch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DebugSnapshot {
    pub size_tx_mb: f64,
    pub size_tx_mb_inc: f64,
    pub phy_errors: u32,
    pub phy_errors_inc: u32,
    pub overflows: u32,
    pub overflows_inc: u32,
}

/// Raw cumulative counters as reported by the firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardCounters {
    pub phy_errors: u32,
    pub overflows: u32,
}

impl BoardCounters {
    pub const WIRE_LEN: usize = 8;

    /// Little-endian `phy_errors`, `overflows`; trailing bytes are reserved.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(BoardCounters {
            phy_errors: word(0),
            overflows: word(4),
        })
    }
}

/// Host-side bookkeeping that turns cumulative counters into snapshots.
#[derive(Debug, Default)]
pub struct DebugCounters {
    last_bytes: u64,
    last: BoardCounters,
}

impl DebugCounters {
    pub fn observe(&mut self, bytes_received: u64, board: BoardCounters, latch: bool) -> DebugSnapshot {
        let snapshot = DebugSnapshot {
            size_tx_mb: bytes_received as f64 / BYTES_PER_MB,
            size_tx_mb_inc: bytes_received.saturating_sub(self.last_bytes) as f64 / BYTES_PER_MB,
            phy_errors: board.phy_errors,
            phy_errors_inc: board.phy_errors.wrapping_sub(self.last.phy_errors),
            overflows: board.overflows,
            overflows_inc: board.overflows.wrapping_sub(self.last.overflows),
        };
        if latch {
            self.last_bytes = bytes_received;
            self.last = board;
        }
        snapshot
    }
}

/// Driver backend, picked once when the session is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Bulk transfers through the operating system's USB stack.
    NativeBulk,
    /// Cypress CyAPI driver (Windows only).
    VendorSdk,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "libusb" => Ok(Backend::NativeBulk),
            "cypress" => Ok(Backend::VendorSdk),
            other => Err(format!("unknown driver '{other}', expected 'cypress' or 'libusb'")),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::NativeBulk => write!(f, "libusb"),
            Backend::VendorSdk => write!(f, "cypress"),
        }
    }
}

/// Construct the device for `backend`. The handle still needs [`DeviceHandle::init`].
pub fn open_device(backend: Backend) -> Arc<dyn DeviceHandle> {
    match backend {
        Backend::NativeBulk => Arc::new(Fx3Device::new()),
        Backend::VendorSdk => {
            log::warn!("the cypress driver is not available in this build, falling back to libusb");
            Arc::new(Fx3Device::new())
        }
    }
}
