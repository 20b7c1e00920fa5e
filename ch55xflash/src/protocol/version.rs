//! Protocol version behaviour table.
//!
//! CH55x chips ship with one of two incompatible bootloader protocols. All
//! version-dependent constants live here so the codec and session can stay
//! free of scattered version checks.

use std::fmt;

use crate::target::chip::BootloaderVersion;

/// Transport kinds a session can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportKind {
    /// USB bulk endpoint pair.
    Usb,
    /// UART link.
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "USB"),
            Self::Serial => write!(f, "serial"),
        }
    }
}

/// Which flash operation a chunk sequence feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Program flash.
    Write,
    /// Compare flash against the image.
    Verify,
}

/// Bootloader protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolVersion {
    /// Bootloader 1.x (USB only, plain data, 60-byte chunks).
    V1,
    /// Bootloader 2.31 and later (USB or UART, scrambled data, 56-byte chunks).
    V2,
}

impl ProtocolVersion {
    /// Select the protocol for a detected bootloader version.
    ///
    /// Returns `None` for versions whose protocol is unknown.
    pub fn for_bootloader(version: BootloaderVersion) -> Option<Self> {
        match version.major {
            1 => Some(Self::V1),
            2 if (version.minor, version.patch) >= (3, 1) => Some(Self::V2),
            _ => None,
        }
    }

    /// Opcode of the write command.
    pub const fn write_opcode(self) -> u8 {
        match self {
            Self::V1 => 0xA8,
            Self::V2 => 0xA5,
        }
    }

    /// Opcode of the verify command.
    pub const fn verify_opcode(self) -> u8 {
        match self {
            Self::V1 => 0xA7,
            Self::V2 => 0xA6,
        }
    }

    /// Largest payload one write frame may carry.
    pub const fn max_write_chunk(self) -> usize {
        match self {
            Self::V1 => 0x3C,
            Self::V2 => 0x38,
        }
    }

    /// Largest payload one verify frame may carry.
    pub const fn max_verify_chunk(self) -> usize {
        self.max_write_chunk()
    }

    /// Maximum chunk length for the given operation.
    pub const fn max_chunk(self, kind: ChunkKind) -> usize {
        match kind {
            ChunkKind::Write => self.max_write_chunk(),
            ChunkKind::Verify => self.max_verify_chunk(),
        }
    }

    /// Boundary the final chunk is padded to (1 means no padding).
    pub const fn block_align(self) -> usize {
        match self {
            Self::V1 => 1,
            Self::V2 => 8,
        }
    }

    /// Whether write/verify data is XOR-ed with the bootkey.
    pub const fn scrambles_payload(self) -> bool {
        matches!(self, Self::V2)
    }

    /// Whether the protocol can run over the given transport.
    pub const fn supports(self, transport: TransportKind) -> bool {
        match (self, transport) {
            (_, TransportKind::Usb) | (Self::V2, TransportKind::Serial) => true,
            (Self::V1, TransportKind::Serial) => false,
        }
    }

    /// Whether a status byte is a positive acknowledgment.
    ///
    /// V2 bootloaders occasionally report `0xFE` for chunks that were in fact
    /// programmed correctly.
    pub const fn is_ack(self, status: u8) -> bool {
        match self {
            Self::V1 => status == 0x00,
            Self::V2 => status == 0x00 || status == 0xFE,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "V1"),
            Self::V2 => write!(f, "V2.31+"),
        }
    }
}
