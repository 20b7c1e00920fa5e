//! CH55x chip table.
//!
//! Maps the chip id reported by the bootloader to a chip model and the flash
//! geometry the session needs for erase and chunk planning.

use std::fmt;

use crate::error::{Error, Result};
use crate::protocol::version::{ChunkKind, ProtocolVersion};

/// Size of one V1 erase block.
pub const ERASE_BLOCK_SIZE: usize = 1024;

/// Value of erased flash; used to pad fixed-size final chunks.
pub const ERASED_FILL: u8 = 0xFF;

/// Supported chip models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChipModel {
    /// CH551.
    Ch551,
    /// CH552.
    Ch552,
    /// CH554.
    Ch554,
    /// CH558.
    Ch558,
    /// CH559.
    Ch559,
}

impl ChipModel {
    /// All known models.
    pub const ALL: [Self; 5] = [
        Self::Ch551,
        Self::Ch552,
        Self::Ch554,
        Self::Ch558,
        Self::Ch559,
    ];

    /// Look up a model by the chip id byte from the identify reply.
    pub fn from_id(chip_id: u8) -> Option<Self> {
        match chip_id {
            0x51 => Some(Self::Ch551),
            0x52 => Some(Self::Ch552),
            0x54 => Some(Self::Ch554),
            0x58 => Some(Self::Ch558),
            0x59 => Some(Self::Ch559),
            _ => None,
        }
    }

    /// Chip id byte reported by the bootloader.
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::Ch551 => 0x51,
            Self::Ch552 => 0x52,
            Self::Ch554 => 0x54,
            Self::Ch558 => 0x58,
            Self::Ch559 => 0x59,
        }
    }

    /// Get the chip model from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "ch551" => Some(Self::Ch551),
            "ch552" => Some(Self::Ch552),
            "ch554" => Some(Self::Ch554),
            "ch558" => Some(Self::Ch558),
            "ch559" => Some(Self::Ch559),
            _ => None,
        }
    }

    /// Application code flash in bytes, ending below the bootloader.
    #[must_use]
    pub fn flash_size(&self) -> usize {
        match self {
            Self::Ch551 => 10 * 1024,
            Self::Ch552 | Self::Ch554 => 0x3800,
            Self::Ch558 => 40 * 1024,
            Self::Ch559 => 0xF400,
        }
    }

    /// Number of 1 KiB blocks the 1.x bootloader is asked to erase.
    ///
    /// Covers the whole flash array; the bootloader skips blocks it owns.
    #[must_use]
    pub fn erase_block_count(&self) -> usize {
        match self {
            Self::Ch551 | Self::Ch552 | Self::Ch554 => 16,
            Self::Ch558 | Self::Ch559 => 64,
        }
    }

    /// Sector count argument of the V2 erase command.
    #[must_use]
    pub fn erase_units(&self) -> u8 {
        match self {
            Self::Ch559 => 0x1D,
            _ => 8,
        }
    }
}

impl fmt::Display for ChipModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ch551 => write!(f, "CH551"),
            Self::Ch552 => write!(f, "CH552"),
            Self::Ch554 => write!(f, "CH554"),
            Self::Ch558 => write!(f, "CH558"),
            Self::Ch559 => write!(f, "CH559"),
        }
    }
}

/// Bootloader firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BootloaderVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl BootloaderVersion {
    /// Create a version triple.
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Decode the packed nibble byte of a V1 config reply (`0x11` = 1.1).
    pub const fn from_nibbles(byte: u8) -> Self {
        Self::new(byte >> 4, byte & 0x0F, 0)
    }
}

impl fmt::Display for BootloaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // WCH writes 2.3.1 as "2.31"
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}{}", self.major, self.minor, self.patch)
        }
    }
}

/// Identity of the detected chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChipIdentity {
    /// Raw chip id byte.
    pub chip_id: u8,
    /// Chip model.
    pub model: ChipModel,
    /// Bootloader version.
    pub bootloader_version: BootloaderVersion,
    /// Protocol selected for this bootloader.
    pub protocol: ProtocolVersion,
}

impl ChipIdentity {
    /// Build an identity, rejecting unknown chips and bootloaders.
    pub fn new(chip_id: u8, bootloader_version: BootloaderVersion) -> Result<Self> {
        let model = ChipModel::from_id(chip_id).ok_or(Error::UnsupportedChip(chip_id))?;
        let protocol = ProtocolVersion::for_bootloader(bootloader_version)
            .ok_or_else(|| Error::UnsupportedBootloader(bootloader_version.to_string()))?;
        Ok(Self {
            chip_id,
            model,
            bootloader_version,
            protocol,
        })
    }

    /// Flash layout for this chip and protocol.
    pub fn layout(&self) -> FlashLayout {
        FlashLayout::new(self.model, self.protocol)
    }
}

/// Flash geometry and chunking limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashLayout {
    /// Code flash size in bytes.
    pub total_size: usize,
    /// Size of one erase block.
    pub erase_block_size: usize,
    /// Blocks erased one by one on 1.x bootloaders.
    pub erase_block_count: usize,
    /// Argument of the V2 erase command.
    pub erase_units: u8,
    /// Largest write payload.
    pub max_write_chunk: usize,
    /// Largest verify payload.
    pub max_verify_chunk: usize,
    /// Final chunk is padded to a multiple of this (1 = unpadded).
    pub block_align: usize,
    /// Padding byte.
    pub fill_byte: u8,
}

impl FlashLayout {
    /// Layout for a chip running the given protocol.
    pub fn new(model: ChipModel, protocol: ProtocolVersion) -> Self {
        Self {
            total_size: model.flash_size(),
            erase_block_size: ERASE_BLOCK_SIZE,
            erase_block_count: model.erase_block_count(),
            erase_units: model.erase_units(),
            max_write_chunk: protocol.max_write_chunk(),
            max_verify_chunk: protocol.max_verify_chunk(),
            block_align: protocol.block_align(),
            fill_byte: ERASED_FILL,
        }
    }

    /// Maximum chunk length for the given operation.
    pub fn max_chunk(&self, kind: ChunkKind) -> usize {
        match kind {
            ChunkKind::Write => self.max_write_chunk,
            ChunkKind::Verify => self.max_verify_chunk,
        }
    }

    /// Number of `EraseBlock` round trips of a 1.x erase.
    pub fn erase_blocks(&self) -> usize {
        self.erase_block_count
    }
}
