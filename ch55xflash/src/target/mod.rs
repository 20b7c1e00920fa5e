//! Chip/target support.

pub mod chip;

pub use chip::{BootloaderVersion, ChipIdentity, ChipModel, FlashLayout};
