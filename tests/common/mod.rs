#![allow(dead_code)]

use std::{
    io::{self, Write},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use nut4nt_dumper::{
    calibration::{CalibrationConfig, WarmupTiming},
    device::{DebugSnapshot, DeviceError, DeviceHandle, Handler},
    session::{DumpDuration, SessionConfig},
    sink::Destination,
};

/// `debug_snapshot` calls made by one calibration run.
pub const CALIBRATION_POLLS: usize = 6;
pub const CONTROL_REGISTER: u8 = 0x05;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start { with_handler: bool },
    Stop,
    ChangeHandler { attached: bool },
    Write(u8, u8),
    Read(u8),
}

type SnapshotScript = Box<dyn Fn(usize) -> DebugSnapshot + Send + Sync>;
type RegisterScript = Box<dyn Fn(u8, u8) -> u8 + Send + Sync>;

#[derive(Clone, Default)]
pub struct Probe {
    pub snapshot_calls: Arc<AtomicUsize>,
    pub events: Arc<Mutex<Vec<Event>>>,
    pub released: Arc<AtomicUsize>,
}

impl Probe {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn snapshots(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }
}

/// In-memory board whose counters and registers follow a script.
pub struct ScriptedDevice {
    snapshots: SnapshotScript,
    registers: RegisterScript,
    feed: usize,
    selected: AtomicU8,
    handler: Mutex<Option<Handler>>,
    probe: Probe,
}

pub fn traffic(mb: f64) -> DebugSnapshot {
    DebugSnapshot {
        size_tx_mb_inc: mb,
        ..Default::default()
    }
}

pub fn overflow(count: u32) -> DebugSnapshot {
    DebugSnapshot {
        overflows: count,
        overflows_inc: count,
        ..Default::default()
    }
}

impl ScriptedDevice {
    pub fn new() -> Self {
        ScriptedDevice {
            snapshots: Box::new(|_| traffic(0.001)),
            registers: Box::new(|channel, address| {
                if address == CONTROL_REGISTER {
                    channel << 4
                } else {
                    address
                }
            }),
            feed: 0,
            selected: AtomicU8::new(0),
            handler: Mutex::new(None),
            probe: Probe::default(),
        }
    }

    pub fn snapshots(mut self, script: impl Fn(usize) -> DebugSnapshot + Send + Sync + 'static) -> Self {
        self.snapshots = Box::new(script);
        self
    }

    /// `script(selected_channel, address)` answers register reads.
    pub fn registers(mut self, script: impl Fn(u8, u8) -> u8 + Send + Sync + 'static) -> Self {
        self.registers = Box::new(script);
        self
    }

    /// Bytes pushed to the attached handler on every snapshot.
    pub fn feed(mut self, bytes: usize) -> Self {
        self.feed = bytes;
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }

    fn record(&self, event: Event) {
        self.probe.events.lock().unwrap().push(event);
    }
}

impl DeviceHandle for ScriptedDevice {
    fn init(&self, _firmware: &Path, _channel_config: &Path) -> Result<(), DeviceError> {
        Ok(())
    }

    fn start_streaming(&self, handler: Option<Handler>) -> Result<(), DeviceError> {
        self.record(Event::Start {
            with_handler: handler.is_some(),
        });
        *self.handler.lock().unwrap() = handler;
        Ok(())
    }

    fn stop_streaming(&self) -> Result<(), DeviceError> {
        self.record(Event::Stop);
        Ok(())
    }

    fn change_handler(&self, handler: Option<Handler>) {
        self.record(Event::ChangeHandler {
            attached: handler.is_some(),
        });
        *self.handler.lock().unwrap() = handler;
    }

    fn write_register(&self, address: u8, value: u8) -> Result<(), DeviceError> {
        self.record(Event::Write(address, value));
        if address == CONTROL_REGISTER {
            self.selected.store(value >> 4, Ordering::SeqCst);
        }
        Ok(())
    }

    fn read_register(&self, address: u8) -> Result<u8, DeviceError> {
        self.record(Event::Read(address));
        Ok((self.registers)(self.selected.load(Ordering::SeqCst), address))
    }

    fn debug_snapshot(&self, _latch: bool) -> Result<DebugSnapshot, DeviceError> {
        let call = self.probe.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if self.feed > 0 {
            if let Some(handler) = self.handler.lock().unwrap().as_ref() {
                handler.on_samples(&vec![0x5a; self.feed]);
            }
        }
        Ok((self.snapshots)(call))
    }
}

impl Drop for ScriptedDevice {
    fn drop(&mut self) {
        self.probe.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Session timings shrunk so a full session runs in milliseconds.
pub fn fast_config(dir: &Path, destination: Destination, duration: DumpDuration) -> SessionConfig {
    let mut config = SessionConfig::new(destination, duration);
    config.register_log = dir.join("regdump.txt");
    config.monitor_interval = Duration::from_millis(10);
    config.calibration = CalibrationConfig {
        warmup: WarmupTiming {
            initial_settle: Duration::from_millis(1),
            probe_run: Duration::from_millis(1),
            probe_pause: Duration::from_millis(1),
            steady_settle: Duration::from_millis(1),
        },
        cadence: Duration::from_millis(1),
        iterations: 5,
        post_settle: Duration::ZERO,
    };
    config.poller.busy_interval = Duration::from_micros(50);
    config
}

/// Rate measured by `fast_config` when every poll reports `mb` megabytes.
pub fn fast_rate(mb: f64) -> f64 {
    mb * 5.0 * 1_048_576.0 / 0.005
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// `Write` into a buffer the test can still read after handing it off.
#[derive(Clone, Default)]
pub struct SharedLog(pub Arc<Mutex<Vec<u8>>>);

impl SharedLog {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
