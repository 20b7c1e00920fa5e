//! Human-readable log of every bootloader frame.
//!
//! Wraps any [`Transport`] and appends one line per frame:
//!
//! ```text
//! # ch55xflash 0.1.0, USB usb:001:007
//! tx = a1:12:00:52:11:4d:43:55:20:49:53:50:20:26:20:57:43:48:2e:43:4e
//! rx = a1:00:02:00:52:11
//! rx = timeout
//! ```

use anyhow::{Context, Result};
use ch55xflash::protocol::hex;
use ch55xflash::{Error, Transport, TransportKind};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Transport wrapper recording traffic to a file.
pub(crate) struct FrameLog<T: Transport> {
    inner: T,
    file: File,
}

impl<T: Transport> FrameLog<T> {
    /// Open `path` for appending and write the header line.
    pub(crate) fn create(inner: T, path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open frame log {}", path.display()))?;
        writeln!(
            file,
            "# ch55xflash {}, {} {}",
            env!("CARGO_PKG_VERSION"),
            inner.kind(),
            inner.name()
        )
        .with_context(|| format!("Failed to write frame log {}", path.display()))?;
        Ok(Self { inner, file })
    }

    fn record(&mut self, line: &str) {
        if let Err(e) = writeln!(self.file, "{line}") {
            debug!("Frame log write failed: {e}");
        }
    }
}

impl<T: Transport> Transport for FrameLog<T> {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn send(&mut self, data: &[u8]) -> ch55xflash::Result<()> {
        self.record(&format!("tx = {}", hex(data)));
        self.inner.send(data)
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> ch55xflash::Result<Vec<u8>> {
        let result = self.inner.receive(max_len, timeout);
        let line = match &result {
            Ok(reply) => format!("rx = {}", hex(reply)),
            Err(Error::Timeout(_)) => "rx = timeout".to_string(),
            Err(e) => format!("rx = error: {e}"),
        };
        self.record(&line);
        result
    }

    fn close(&mut self) -> ch55xflash::Result<()> {
        if let Err(e) = self.file.flush() {
            debug!("Frame log flush failed: {e}");
        }
        self.inner.close()
    }
}
