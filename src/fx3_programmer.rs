/* The upload sequence in this file is adapted from
 * https://github.com/nicholasbishop/cyusb-rs/blob/043496d/src/bin/cyusb_programmer.rs
 * and thus licensed under Apache-2.0.
 * It was then adapted from rusb to nusb.
 */

use log::{debug, info, warn};
use nusb::{
    Device,
    transfer::{Control, ControlType, Recipient},
};
use std::{fs, io, path::Path, thread, time::Duration};

/// Largest chunk the FX3 bootloader accepts in one control request.
const MAX_CHUNK: usize = 4096;
const BOOTLOADER_REQUEST: u8 = 0xa0;

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("cannot read firmware image: {0}")]
    Io(#[from] io::Error),

    /// "CY" prefix is missing
    #[error("invalid prefix")]
    MissingMagic,

    #[error("image is not executable")]
    NotExecutable,

    #[error("abnormal image type {0:#04x}")]
    AbnormalFirmware(u8),

    #[error("invalid checksum (expected {expected:#010x}, computed {computed:#010x})")]
    InvalidChecksum { expected: u32, computed: u32 },

    #[error("image truncated at offset {0}")]
    Truncated(usize),

    #[error("device accepted no data at {address:#010x}")]
    Stalled { address: u32 },

    #[error("usb control transfer error: {0}")]
    UsbTransfer(#[from] nusb::transfer::TransferError),
}

/// One contiguous block of the image, loaded at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

/// A parsed FX3 boot image ready to be written to device RAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub segments: Vec<Segment>,
    pub entry_address: u32,
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], FirmwareError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FirmwareError::Truncated(self.offset))?;
        let chunk = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(chunk)
    }

    fn u32(&mut self) -> Result<u32, FirmwareError> {
        let chunk = self.take(4)?;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }
}

fn checksum(sum: u32, data: &[u8]) -> u32 {
    data.chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(sum, u32::wrapping_add)
}

impl FirmwareImage {
    /// Firmware files should be quite small, so the whole file is loaded in memory.
    pub fn load(path: &Path) -> Result<Self, FirmwareError> {
        Self::parse(&fs::read(path)?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FirmwareError> {
        let mut reader = Reader { bytes, offset: 0 };
        let header = reader.take(4)?;

        if &header[..2] != b"CY" {
            return Err(FirmwareError::MissingMagic);
        }
        if header[2] & 0x01 != 0 {
            return Err(FirmwareError::NotExecutable);
        }
        // Only normal FW binaries with checksum
        if header[3] != 0xb0 {
            return Err(FirmwareError::AbnormalFirmware(header[3]));
        }

        let mut segments = Vec::new();
        let mut computed = 0u32;
        let entry_address = loop {
            let words = reader.u32()? as usize;
            let address = reader.u32()?;
            if words == 0 {
                break address;
            }
            let len = words.checked_mul(4).ok_or(FirmwareError::Truncated(reader.offset))?;
            let data = reader.take(len)?;
            computed = checksum(computed, data);
            segments.push(Segment {
                address,
                data: data.to_vec(),
            });
        };

        let expected = reader.u32()?;
        if expected != computed {
            return Err(FirmwareError::InvalidChecksum { expected, computed });
        }

        Ok(FirmwareImage {
            segments,
            entry_address,
        })
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Download the image to RAM on a Cypress FX3 and jump to its entry point.
    pub fn upload(&self, device: &Device) -> Result<(), FirmwareError> {
        info!(
            "transferring {} bytes in {} segments to the device",
            self.len(),
            self.segments.len()
        );
        if self.is_empty() {
            warn!("image has no segments, only jumping to the entry point");
        }
        for segment in &self.segments {
            write_segment(segment, |address, chunk| write_control(device, address, chunk))?;
            debug!("segment at {:#010x} written", segment.address);
        }

        thread::sleep(Duration::from_secs(1));

        info!("jumping to entry point {:#010x}", self.entry_address);
        write_control(device, self.entry_address, &[])?;
        Ok(())
    }
}

/// Write `segment` in bootloader-sized chunks, resending whatever a short
/// write left behind.
fn write_segment(
    segment: &Segment,
    mut write: impl FnMut(u32, &[u8]) -> Result<usize, FirmwareError>,
) -> Result<(), FirmwareError> {
    let mut address = segment.address;
    let mut pending = segment.data.as_slice();
    while !pending.is_empty() {
        let chunk = &pending[..pending.len().min(MAX_CHUNK)];
        let written = write(address, chunk)?.min(chunk.len());
        if written == 0 {
            return Err(FirmwareError::Stalled { address });
        }
        address = address.wrapping_add(written as u32);
        pending = &pending[written..];
    }
    Ok(())
}

fn write_control(device: &Device, address: u32, data: &[u8]) -> Result<usize, FirmwareError> {
    let bytes_written = device.control_out_blocking(
        Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: BOOTLOADER_REQUEST,
            value: (address & 0x0000ffff) as u16,
            index: (address >> 16) as u16,
        },
        data,
        Duration::from_secs(1),
    )?;
    Ok(bytes_written)
}
