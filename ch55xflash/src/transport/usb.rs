//! USB transport using the `rusb` crate.
//!
//! The CH55x bootloader enumerates as a vendor-specific device with a single
//! interface carrying one bulk IN and one bulk OUT endpoint. Frames travel
//! unwrapped, one frame per transfer.

use {
    crate::{
        error::{Error, Result},
        protocol::frame::PACKET_SIZE,
        transport::{PortInfo, Transport, TransportKind},
    },
    log::{debug, trace},
    rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType},
    std::time::Duration,
};

/// USB vendor ID of the CH55x bootloader.
pub const CH55X_VID: u16 = 0x4348;

/// USB product ID of the CH55x bootloader.
pub const CH55X_PID: u16 = 0x55E0;

/// Interface carrying the bulk endpoints.
const INTERFACE: u8 = 0;

/// Timeout for OUT transfers.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Bulk endpoint link to a CH55x bootloader.
pub struct UsbTransport {
    handle: Option<DeviceHandle<GlobalContext>>,
    ep_in: u8,
    ep_out: u8,
    name: String,
}

impl UsbTransport {
    /// Open the first CH55x bootloader on the bus.
    pub fn open() -> Result<Self> {
        Self::open_with(CH55X_VID, CH55X_PID)
    }

    /// Open the first device matching `vid:pid`.
    pub fn open_with(vid: u16, pid: u16) -> Result<Self> {
        let device = find_device(vid, pid)?.ok_or_else(|| {
            Error::NoDevice(format!("no USB device {vid:04x}:{pid:04x} present"))
        })?;
        let name = bus_name(&device);
        let (ep_in, ep_out) = bulk_endpoints(&device)?;

        let mut handle = device.open()?;
        if let Err(e) = handle.reset() {
            debug!("USB reset of {name} failed: {e}");
        }
        if handle
            .kernel_driver_active(INTERFACE)
            .unwrap_or(false)
        {
            debug!("Detaching kernel driver from {name}");
            handle.detach_kernel_driver(INTERFACE)?;
        }
        handle.claim_interface(INTERFACE)?;

        debug!("Opened {name} (IN {ep_in:#04x}, OUT {ep_out:#04x})");
        Ok(Self {
            handle: Some(handle),
            ep_in,
            ep_out,
            name,
        })
    }

    /// List attached CH55x bootloaders.
    pub fn list_devices() -> Result<Vec<PortInfo>> {
        let mut found = Vec::new();
        for device in rusb::devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() == CH55X_VID && desc.product_id() == CH55X_PID {
                found.push(PortInfo {
                    name: bus_name(&device),
                    kind: TransportKind::Usb,
                    vid: Some(desc.vendor_id()),
                    pid: Some(desc.product_id()),
                    product: Some("CH55x bootloader".to_string()),
                });
            }
        }
        Ok(found)
    }

    fn handle(&self) -> Result<&DeviceHandle<GlobalContext>> {
        self.handle
            .as_ref()
            .ok_or(Error::Disconnected)
    }
}

fn find_device(vid: u16, pid: u16) -> Result<Option<Device<GlobalContext>>> {
    Ok(rusb::devices()?
        .iter()
        .find(|device| {
            device
                .device_descriptor()
                .is_ok_and(|desc| desc.vendor_id() == vid && desc.product_id() == pid)
        }))
}

fn bus_name(device: &Device<GlobalContext>) -> String {
    format!("usb:{:03}:{:03}", device.bus_number(), device.address())
}

/// Find the bulk IN/OUT endpoint pair of the bootloader interface.
fn bulk_endpoints(device: &Device<GlobalContext>) -> Result<(u8, u8)> {
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(_) => device.config_descriptor(0)?,
    };

    let mut ep_in = None;
    let mut ep_out = None;
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            if desc.interface_number() != INTERFACE {
                continue;
            }
            for ep in desc.endpoint_descriptors() {
                if ep.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => ep_in = ep_in.or(Some(ep.address())),
                    Direction::Out => ep_out = ep_out.or(Some(ep.address())),
                }
            }
        }
    }

    match (ep_in, ep_out) {
        (Some(ep_in), Some(ep_out)) => Ok((ep_in, ep_out)),
        _ => Err(Error::NoDevice(
            "device has no bulk endpoint pair on interface 0".into(),
        )),
    }
}

impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let ep_out = self.ep_out;
        let written = self
            .handle()?
            .write_bulk(ep_out, data, SEND_TIMEOUT)?;
        trace!("USB TX {written}/{} bytes", data.len());
        if written != data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short USB write: {written} of {} bytes", data.len()),
            )));
        }
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        // Bulk reads must offer at least one full packet
        let mut buf = vec![0u8; max_len.max(PACKET_SIZE)];
        let ep_in = self.ep_in;
        let n = self
            .handle()?
            .read_bulk(ep_in, &mut buf, timeout)?;
        trace!("USB RX {n} bytes");
        buf.truncate(n.min(max_len));
        Ok(buf)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(INTERFACE) {
                debug!("Releasing interface on {} failed: {e}", self.name);
            }
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}
