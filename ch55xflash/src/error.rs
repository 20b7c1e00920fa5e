//! Error types for ch55xflash.

use std::io;
use thiserror::Error;

/// Result type for ch55xflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ch55xflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB error.
    #[cfg(feature = "native")]
    #[error("USB error: {0}")]
    Usb(rusb::Error),

    /// No reply arrived within the command timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device vanished from the bus while a command was in flight.
    #[error("Device disconnected")]
    Disconnected,

    /// Chip did not answer the detect handshake.
    #[error("No CH55x bootloader found: {0}")]
    NoDevice(String),

    /// Bootloader version is not one of the reverse-engineered protocols.
    #[error("Unsupported bootloader version {0}")]
    UnsupportedBootloader(String),

    /// Chip id is not in the known chip table.
    #[error("Unsupported chip id {0:#04x}")]
    UnsupportedChip(u8),

    /// Protocol version cannot run on the opened transport.
    #[error("Bootloader {version} cannot be driven over {transport}")]
    UnsupportedTransport {
        /// Detected bootloader version.
        version: String,
        /// Transport kind in use.
        transport: String,
    },

    /// Command is not part of the selected protocol version.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Bootloader refused the erase command.
    #[error("Erase rejected: {0}")]
    EraseRejected(String),

    /// A write chunk was not acknowledged.
    #[error("Write failed at offset {offset:#06x}: {detail}")]
    WriteAt {
        /// Offset of the failing chunk.
        offset: u32,
        /// What went wrong with the round trip.
        detail: String,
    },

    /// A verify chunk did not match flash contents.
    #[error("Verify mismatch at offset {offset:#06x}: {detail}")]
    VerifyMismatchAt {
        /// Offset of the failing chunk.
        offset: u32,
        /// What went wrong with the round trip.
        detail: String,
    },

    /// Firmware image does not fit into flash.
    #[error("Image of {len} bytes exceeds flash size of {capacity} bytes")]
    ImageTooLarge {
        /// Image length in bytes.
        len: usize,
        /// Flash capacity in bytes.
        capacity: usize,
    },

    /// Chunk payload longer than the protocol allows (caller bug).
    #[error("Invalid chunk size: {len} bytes (max {max})")]
    InvalidChunkSize {
        /// Payload length.
        len: usize,
        /// Maximum allowed for the protocol version.
        max: usize,
    },

    /// Reply length or layout does not match the expected framing.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Declared checksum does not recompute.
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed locally.
        expected: u8,
        /// Checksum carried by the frame.
        actual: u8,
    },

    /// Reply echoes a different command byte.
    #[error("Unexpected opcode: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedOpcode {
        /// Opcode of the command that was sent.
        expected: u8,
        /// Opcode found in the reply.
        actual: u8,
    },

    /// Operation called in a session state that does not allow it.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Current session state.
        state: String,
    },

    /// Operation interrupted by the embedding application.
    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// Whether this error comes from the transport layer itself rather than
    /// from the bootloader's answer.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(_) | Self::Disconnected => true,
            #[cfg(feature = "native")]
            Self::Serial(_) | Self::Usb(_) => true,
            _ => false,
        }
    }
}

#[cfg(feature = "native")]
impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => Self::Timeout("USB transfer timed out".into()),
            rusb::Error::NoDevice => Self::Disconnected,
            other => Self::Usb(other),
        }
    }
}
