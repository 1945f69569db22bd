/// A UsbContext and UsbDevice for interacting with the physical
/// USB device.
use std::time::Duration;

use log::{debug, info, warn};
pub use rusb::{Context, UsbContext};
use rusb::{DeviceHandle, Error};

use super::Result;

const USB_ANT_INTERFACE: u8 = 0;
const USB_ANT_EP_IN: u8 = 0x81;
const USB_ANT_EP_OUT: u8 = 0x01;
const TX_BUF_SIZE: usize = 255;
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte pipe to the radio. The session only ever talks to the radio through
/// this trait.
pub trait Transport {
    /// Waits up to `timeout` for bytes. `Ok(None)` means nothing arrived.
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Releases the device. Reads and writes fail afterwards.
    fn close(&mut self) -> Result<()>;
}

/// UsbDevice struct that holds the device handle to the USB device
/// along with a buffer to read data into.
pub struct UsbDevice<T: UsbContext> {
    handle: DeviceHandle<T>,
    buffer: [u8; TX_BUF_SIZE],
    claimed: bool,
}

impl<T: UsbContext> UsbDevice<T> {
    /// Open the first ANT radio matching the vendor and product id.
    pub fn open(ctx: &T, vendor_id: u16, product_id: u16) -> Result<UsbDevice<T>> {
        for device in ctx.devices()?.iter() {
            let device_desc = device.device_descriptor()?;
            if device_desc.vendor_id() != vendor_id || device_desc.product_id() != product_id {
                continue;
            }
            info!(
                "Opening ANT radio {:04x}:{:04x} on bus {} address {}",
                vendor_id,
                product_id,
                device.bus_number(),
                device.address()
            );
            let mut handle = device.open()?;
            match handle.reset() {
                Ok(_) => {}
                // The device re-enumerated during the reset, so the old
                // handle is gone.
                Err(Error::NotFound) => handle = device.open()?,
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                debug!("Kernel driver auto-detach unavailable: {}", e);
            }
            handle.claim_interface(USB_ANT_INTERFACE)?;
            return Ok(UsbDevice {
                handle,
                buffer: [0; TX_BUF_SIZE],
                claimed: true,
            });
        }
        Err(Error::NoDevice.into())
    }
}

impl<T: UsbContext> Transport for UsbDevice<T> {
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self
            .handle
            .read_bulk(USB_ANT_EP_IN, &mut self.buffer, timeout)
        {
            Ok(len) => Ok(Some(self.buffer[..len].to_vec())),
            Err(Error::Timeout) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let handle = &self.handle;
        write_all(bytes, |chunk| {
            handle.write_bulk(USB_ANT_EP_OUT, chunk, WRITE_TIMEOUT)
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.claimed {
            self.claimed = false;
            self.handle.release_interface(USB_ANT_INTERFACE)?;
            debug!("Released ANT radio interface");
        }
        Ok(())
    }
}

impl<T: UsbContext> Drop for UsbDevice<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to release ANT radio: {}", e);
        }
    }
}

/// Pushes `bytes` through `write` until all of them went out. A write that
/// takes nothing is an I/O fault.
fn write_all<F>(bytes: &[u8], mut write: F) -> Result<()>
where
    F: FnMut(&[u8]) -> rusb::Result<usize>,
{
    let mut written = 0;
    while written < bytes.len() {
        match write(&bytes[written..])? {
            0 => return Err(Error::Io.into()),
            n => written += n,
        }
    }
    Ok(())
}
