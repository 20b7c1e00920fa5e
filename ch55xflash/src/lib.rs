//! # ch55xflash
//!
//! A library for driving the factory bootloader of WCH CH55x microcontrollers.
//!
//! This crate talks to the ROM bootloader of the CH551, CH552, CH554, CH558 and
//! CH559 over USB or UART, including:
//!
//! - Chip and bootloader detection
//! - Bootloader 1.x and 2.31+ command sets
//! - Bootkey negotiation and payload scrambling (2.31+)
//! - Erase, chunked write and verify, application start
//!
//! ## Supported Bootloaders
//!
//! | Version | Transports  | Chunk size |
//! |---------|-------------|------------|
//! | 1.x     | USB         | 60 bytes   |
//! | 2.31+   | USB, serial | 56 bytes   |
//!
//! ## Features
//!
//! - `native` (default): USB transport via `rusb`, serial transport via `serialport`
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use ch55xflash::{BootloaderSession, SessionConfig, UsbTransport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let firmware = std::fs::read("firmware.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let transport = UsbTransport::open()?;
//!         let mut session = BootloaderSession::new(transport, SessionConfig::default());
//!
//!         session.detect()?;
//!         session.erase()?;
//!         session.write(&firmware, |done, total| {
//!             println!("Writing: {}/{}", done, total);
//!         })?;
//!         session.verify(&firmware, |_, _| {})?;
//!         session.start_app()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod planner;
pub mod protocol;
pub mod session;
pub mod target;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::{SerialTransport, UsbTransport};
pub use {
    error::{Error, Result},
    planner::{Chunk, ChunkPlan, plan},
    protocol::{ChunkKind, Command, ProtocolVersion, Reply, TransportKind, decode, encode},
    session::{BootloaderSession, FailureReason, SessionConfig, SessionState},
    target::{BootloaderVersion, ChipIdentity, ChipModel, FlashLayout},
    transport::{PortInfo, SerialConfig, Transport},
};
