use std::{
    path::Path,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Poll, Waker},
    thread::{self, JoinHandle},
    time::Duration,
};

use futures_lite::future::{block_on, poll_fn};
use log::{debug, error, info, warn};
use nusb::{
    Device, DeviceInfo, Interface,
    transfer::{Control, ControlType, Queue, Recipient, RequestBuffer},
};
use thread_priority::{ThreadPriority, set_current_thread_priority};

use crate::{
    config::ChannelConfig,
    device::{BoardCounters, DebugCounters, DebugSnapshot, DeviceError, DeviceHandle, Handler},
    fx3_programmer::FirmwareImage,
    lock,
};

const VENDOR_ID: u16 = 0x04b4;
const BOOTLOADER_PRODUCT_ID: u16 = 0x00f3;
const STREAMER_PRODUCT_ID: u16 = 0x00f1;
const BULK_IN_ENDPOINT: u8 = 0x81;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const REENUMERATION_DELAY: Duration = Duration::from_millis(1500);

const TRANSFER_SIZE: usize = 2 * 1024 * 1024;
const N_TRANSFERS: usize = 7;

#[derive(Debug, Clone, Copy)]
pub enum Command {
    GetFwVersion = 0xb0,
    Start = 0xb1,
    Stop = 0xb2,
    WriteRegister = 0xb3,
    ReadRegister = 0xb4,
    DebugCounters = 0xb5,
}

#[derive(Debug, Clone, Copy)]
pub struct VersionInfo {
    pub major: u8,
    pub minor: u8,
}

struct Usb {
    device: Device,
    interface: Interface,
}

/// State shared with the bulk reader thread.
#[derive(Default)]
struct Stream {
    stop: AtomicBool,
    waker: Mutex<Option<Waker>>,
    /// Held for the whole callback, so swapping it waits for the callback to return.
    handler: Mutex<Option<Handler>>,
    received: AtomicU64,
}

/// FX3 streamer board driven through the native USB stack.
pub struct Fx3Device {
    usb: OnceLock<Usb>,
    stream: Arc<Stream>,
    reader: Mutex<Option<JoinHandle<()>>>,
    counters: Mutex<DebugCounters>,
}

fn find_device(product_id: u16) -> Option<DeviceInfo> {
    nusb::list_devices()
        .ok()?
        .find(|dev| dev.vendor_id() == VENDOR_ID && dev.product_id() == product_id)
}

fn control(command: Command, value: u16, index: u16) -> Control {
    Control {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request: command as u8,
        value,
        index,
    }
}

pub fn get_version(device: &Device) -> Result<VersionInfo, DeviceError> {
    let mut buffer = [0u8; 2];
    let n = device.control_in_blocking(
        control(Command::GetFwVersion, 0, 0),
        &mut buffer,
        CONTROL_TIMEOUT,
    )?;
    if n != buffer.len() {
        return Err(DeviceError::InvalidResponse("firmware version"));
    }
    Ok(VersionInfo {
        major: buffer[0],
        minor: buffer[1],
    })
}

impl Default for Fx3Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Fx3Device {
    pub fn new() -> Self {
        Fx3Device {
            usb: OnceLock::new(),
            stream: Arc::new(Stream::default()),
            reader: Mutex::new(None),
            counters: Mutex::new(DebugCounters::default()),
        }
    }

    fn usb(&self) -> Result<&Usb, DeviceError> {
        self.usb.get().ok_or(DeviceError::NotInitialized)
    }

    /// Program the bootloader if one is attached, then open the streamer.
    fn boot(firmware: &Path) -> Result<Device, DeviceError> {
        if let Some(descriptor) = find_device(BOOTLOADER_PRODUCT_ID) {
            info!(
                "found FX3 bootloader {:04X}:{:04X}, programming {}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                firmware.display()
            );
            let image = FirmwareImage::load(firmware)?;
            let device = descriptor.open()?;
            image.upload(&device)?;
            drop(device);
            thread::sleep(REENUMERATION_DELAY);
        }

        let descriptor = find_device(STREAMER_PRODUCT_ID).ok_or(DeviceError::NoDevice)?;
        info!(
            "found FX3 streamer {:04X}:{:04X}",
            descriptor.vendor_id(),
            descriptor.product_id()
        );
        Ok(descriptor.open()?)
    }

    fn command(&self, command: Command) -> Result<(), DeviceError> {
        self.usb()?
            .device
            .control_out_blocking(control(command, 0, 0), &[], CONTROL_TIMEOUT)?;
        Ok(())
    }
}

fn read_loop(mut queue: Queue<RequestBuffer>, stream: Arc<Stream>) {
    if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
        warn!("could not raise bulk reader priority: {e:?}");
    }

    loop {
        let next = block_on(poll_fn(|cx| {
            *lock(&stream.waker) = Some(cx.waker().clone());
            if stream.stop.load(Ordering::Acquire) {
                return Poll::Ready(None);
            }
            queue.poll_next(cx).map(Some)
        }));
        let Some(completion) = next else { break };

        if let Err(e) = completion.status {
            error!("bulk transfer failed: {e}");
            break;
        }

        stream
            .received
            .fetch_add(completion.data.len() as u64, Ordering::Relaxed);
        if let Some(handler) = lock(&stream.handler).as_ref() {
            handler.on_samples(&completion.data);
        }

        queue.submit(RequestBuffer::reuse(completion.data, TRANSFER_SIZE));
    }

    queue.cancel_all();
    while queue.pending() > 0 {
        let _ = block_on(queue.next_complete());
    }
    debug!("bulk reader finished");
}

impl DeviceHandle for Fx3Device {
    fn init(&self, firmware: &Path, channel_config: &Path) -> Result<(), DeviceError> {
        let config = ChannelConfig::load(channel_config)?;

        let device = Self::boot(firmware)?;
        device.set_configuration(1)?;
        let interface = device.claim_interface(0)?;
        let version = get_version(&device)?;
        info!("FX3 firmware version: {}.{}", version.major, version.minor);

        if self.usb.set(Usb { device, interface }).is_err() {
            warn!("device was already initialized, keeping the first connection");
        }

        for (address, value) in &config.writes {
            self.write_register(*address, *value)?;
        }
        info!("applied {} frontend registers", config.writes.len());
        Ok(())
    }

    fn start_streaming(&self, handler: Option<Handler>) -> Result<(), DeviceError> {
        let usb = self.usb()?;
        let mut reader = lock(&self.reader);
        if reader.is_some() {
            return Err(DeviceError::AlreadyStreaming);
        }

        *lock(&self.stream.handler) = handler;
        self.stream.stop.store(false, Ordering::Release);

        let mut queue = usb.interface.bulk_in_queue(BULK_IN_ENDPOINT);
        while queue.pending() < N_TRANSFERS {
            queue.submit(RequestBuffer::new(TRANSFER_SIZE));
        }

        self.command(Command::Start)?;

        let stream = self.stream.clone();
        let handle = thread::Builder::new()
            .name("fx3-bulk-in".to_string())
            .spawn(move || read_loop(queue, stream))?;
        *reader = Some(handle);
        debug!("streaming started");
        Ok(())
    }

    fn stop_streaming(&self) -> Result<(), DeviceError> {
        let Some(handle) = lock(&self.reader).take() else {
            return Ok(());
        };

        self.stream.stop.store(true, Ordering::Release);
        if let Some(waker) = lock(&self.stream.waker).take() {
            waker.wake();
        }
        let result = self.command(Command::Stop);
        if handle.join().is_err() {
            error!("bulk reader thread panicked");
        }
        debug!("streaming stopped");
        result
    }

    fn change_handler(&self, handler: Option<Handler>) {
        *lock(&self.stream.handler) = handler;
    }

    fn write_register(&self, address: u8, value: u8) -> Result<(), DeviceError> {
        self.usb()?.device.control_out_blocking(
            control(Command::WriteRegister, value as u16, address as u16),
            &[],
            CONTROL_TIMEOUT,
        )?;
        Ok(())
    }

    fn read_register(&self, address: u8) -> Result<u8, DeviceError> {
        let mut buffer = [0u8; 1];
        let n = self.usb()?.device.control_in_blocking(
            control(Command::ReadRegister, 0, address as u16),
            &mut buffer,
            CONTROL_TIMEOUT,
        )?;
        if n != buffer.len() {
            return Err(DeviceError::InvalidResponse("register read"));
        }
        Ok(buffer[0])
    }

    fn debug_snapshot(&self, latch: bool) -> Result<DebugSnapshot, DeviceError> {
        let mut buffer = [0u8; 16];
        let n = self.usb()?.device.control_in_blocking(
            control(Command::DebugCounters, 0, 0),
            &mut buffer,
            CONTROL_TIMEOUT,
        )?;
        let board = BoardCounters::from_bytes(&buffer[..n])
            .ok_or(DeviceError::InvalidResponse("debug counters"))?;
        let received = self.stream.received.load(Ordering::Relaxed);
        Ok(lock(&self.counters).observe(received, board, latch))
    }
}

impl Drop for Fx3Device {
    fn drop(&mut self) {
        if let Err(e) = self.stop_streaming() {
            warn!("failed to stop streaming on release: {e}");
        }
    }
}
