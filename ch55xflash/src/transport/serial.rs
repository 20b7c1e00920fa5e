//! UART transport using the `serialport` crate.
//!
//! Frames are wrapped with the link preamble and checksum from
//! [`protocol::link`](crate::protocol::link) on the way out, and validated and
//! stripped on the way in.

use {
    crate::{
        error::{Error, Result},
        protocol::link,
        transport::{PortInfo, SerialConfig, Transport, TransportKind},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{ErrorKind, Read, Write},
        thread,
        time::Duration,
    },
};

/// Write a host frame with link framing.
pub(crate) fn write_link_frame<W: Write + ?Sized>(port: &mut W, frame: &[u8]) -> Result<()> {
    let wrapped = link::wrap(frame);
    trace!("Serial TX {} bytes", wrapped.len());
    port.write_all(&wrapped)?;
    port.flush()?;
    Ok(())
}

/// Read one chip reply and strip its link framing.
pub(crate) fn read_link_frame<R: Read + ?Sized>(port: &mut R, max_len: usize) -> Result<Vec<u8>> {
    let mut head = [0u8; link::REPLY_HEAD_LEN];
    read_exact(port, &mut head)?;

    let total = link::reply_frame_len(&head)
        .ok_or_else(|| Error::MalformedResponse("short link header".into()))?;
    if total - link::OVERHEAD > max_len {
        return Err(Error::MalformedResponse(format!(
            "reply of {} bytes exceeds the {max_len} byte limit",
            total - link::OVERHEAD
        )));
    }

    let mut raw = vec![0u8; total];
    raw[..head.len()].copy_from_slice(&head);
    read_exact(port, &mut raw[head.len()..])?;
    trace!("Serial RX {} bytes", raw.len());

    link::unwrap(&raw)
}

fn read_exact<R: Read + ?Sized>(port: &mut R, buf: &mut [u8]) -> Result<()> {
    port.read_exact(buf)
        .map_err(|e| match e.kind() {
            ErrorKind::TimedOut | ErrorKind::UnexpectedEof => {
                Error::Timeout("no reply on serial port".into())
            },
            _ => Error::Io(e),
        })
}

/// Serial link to a V2 bootloader.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    baud_rate: u32,
}

impl SerialTransport {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        let mut transport = Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
            baud_rate: config.baud_rate,
        };
        debug!(
            "Port {} opened at {} baud",
            transport.name, transport.baud_rate
        );

        if config.dtr_reset {
            transport.enter_bootloader()?;
        }
        Ok(transport)
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, crate::transport::DEFAULT_BAUD))
    }

    /// Pulse DTR so boards wired for auto-reset start the bootloader.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        debug!("Pulsing DTR on {} to start the bootloader", self.name);
        let port = self.port_mut()?;
        thread::sleep(Duration::from_millis(10));
        port.write_data_terminal_ready(true)?;
        thread::sleep(Duration::from_millis(150));
        port.write_data_terminal_ready(false)?;
        thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// List serial ports on this host.
    pub fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, product) = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => {
                        (Some(info.vid), Some(info.pid), info.product)
                    },
                    _ => (None, None, None),
                };
                PortInfo {
                    name: p.port_name,
                    kind: TransportKind::Serial,
                    vid,
                    pid,
                    product,
                }
            })
            .collect())
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::new(ErrorKind::NotConnected, "port closed")))
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        // Drop stale bytes so the next reply lines up with this command
        port.clear(ClearBuffer::Input)?;
        write_link_frame(port, data)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port_mut()?;
        port.set_timeout(timeout)?;
        read_link_frame(port, max_len)
    }

    fn close(&mut self) -> Result<()> {
        if self
            .port
            .take()
            .is_some()
        {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}
