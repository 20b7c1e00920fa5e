//! Transport abstraction for talking to the bootloader.
//!
//! The session is written against the [`Transport`] trait only. Two native
//! implementations exist:
//!
//! - **USB** ([`UsbTransport`]): bulk endpoint pair of the bootloader's
//!   vendor interface, via `rusb`
//! - **Serial** ([`SerialTransport`]): UART link at 57 600 baud, via
//!   `serialport`; only V2 bootloaders listen on the UART
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------+
//! |            BootloaderSession             |
//! |   (detect, erase, write, verify, start)  |
//! +--------------------+---------------------+
//!                      |
//!                      v
//! +--------------------+---------------------+
//! |             Transport trait              |
//! +----------+-------------------+-----------+
//!            |                   |
//!            v                   v
//! +----------+-------+  +--------+-----------+
//! |   UsbTransport   |  |  SerialTransport   |
//! |     (rusb)       |  | (serialport, link) |
//! +------------------+  +--------------------+
//! ```
//!
//! Frames passed to and returned from a transport are always bare bootloader
//! frames; any link-level framing is the transport's business.

#[cfg(feature = "native")]
pub mod serial;
#[cfg(feature = "native")]
pub mod usb;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use crate::error::Result;
pub use crate::protocol::version::TransportKind;

/// Default baud rate of the CH55x UART bootloader.
pub const DEFAULT_BAUD: u32 = 57_600;

/// Byte channel to the bootloader.
///
/// The channel is strictly request/response: callers send one frame and then
/// wait for its reply before sending the next.
pub trait Transport {
    /// Which kind of link this is.
    fn kind(&self) -> TransportKind;

    /// Human-readable name (port path or USB bus address).
    fn name(&self) -> &str;

    /// Send one complete frame.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive one reply of at most `max_len` bytes.
    ///
    /// Returns [`Error::Timeout`](crate::Error::Timeout) when nothing arrives
    /// within `timeout`, and [`Error::Disconnected`](crate::Error::Disconnected)
    /// when the device has left the bus.
    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Close the link and release the handle.
    ///
    /// After calling this method, the transport cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).receive(max_len, timeout)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Default read/write timeout.
    pub timeout: Duration,
    /// Pulse DTR after opening to drop the chip into its bootloader.
    pub dtr_reset: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(150),
            dtr_reset: true,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable the DTR reset pulse.
    #[must_use]
    pub fn with_dtr_reset(mut self, dtr_reset: bool) -> Self {
        self.dtr_reset = dtr_reset;
        self
    }
}

/// Information about a candidate port or USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path, or USB bus address.
    pub name: String,
    /// Link kind.
    pub kind: TransportKind,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Product string (if available).
    pub product: Option<String>,
}

#[cfg(feature = "native")]
pub use serial::SerialTransport;
#[cfg(feature = "native")]
pub use usb::UsbTransport;
