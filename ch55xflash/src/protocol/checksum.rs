//! Byte checksums and the V2 bootkey.
//!
//! The CH55x bootloader only ever uses an 8-bit wrapping sum. It appears in
//! three places:
//!
//! - the trailer byte of every UART link frame,
//! - the seed checksum taken over the chip's unique id (config reply bytes
//!   22..26),
//! - the key checksum the chip echoes back after an `IspKey` command.
//!
//! V2 bootloaders additionally scramble write/verify data by XOR-ing it with an
//! 8-byte bootkey derived from a host-chosen seed.

/// Length of the bootkey in bytes.
pub const BOOTKEY_LEN: usize = 8;

/// Minimum seed length accepted by the key derivation.
pub const MIN_SEED_LEN: usize = 30;

/// 8-bit wrapping sum over `data`.
pub fn sum8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// XOR key applied to V2 write/verify payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bootkey([u8; BOOTKEY_LEN]);

impl Bootkey {
    /// Derive the bootkey from the seed sent with `IspKey`.
    ///
    /// `seed_sum` is the checksum of the chip's unique id bytes and `chip_id`
    /// the id reported by the identify reply. Returns `None` when the seed is
    /// too short for the sampling pattern.
    #[must_use]
    pub fn derive(seed: &[u8], seed_sum: u8, chip_id: u8) -> Option<Self> {
        if seed.len() < MIN_SEED_LEN {
            return None;
        }

        let mut key = [0u8; BOOTKEY_LEN];

        let step = seed.len() / 7;
        key[0] = seed[step * 4] ^ seed_sum;
        key[2] = seed[step] ^ seed_sum;
        key[3] = seed[step * 6] ^ seed_sum;
        key[4] = seed[step * 3] ^ seed_sum;
        key[6] = seed[step * 5] ^ seed_sum;

        let step = seed.len() / 5;
        key[1] = seed[step] ^ seed_sum;
        key[5] = seed[step * 3] ^ seed_sum;

        key[7] = chip_id.wrapping_add(key[0]);

        Some(Self(key))
    }

    /// Raw key bytes.
    pub fn bytes(&self) -> &[u8; BOOTKEY_LEN] {
        &self.0
    }

    /// Checksum the bootloader echoes after accepting the key.
    pub fn checksum(&self) -> u8 {
        sum8(&self.0)
    }

    /// XOR `data` with the key, restarting the key at the chunk start.
    ///
    /// Scrambling is its own inverse.
    #[must_use]
    pub fn scramble(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, &b)| b ^ self.0[i & (BOOTKEY_LEN - 1)])
            .collect()
    }
}

impl From<[u8; BOOTKEY_LEN]> for Bootkey {
    fn from(bytes: [u8; BOOTKEY_LEN]) -> Self {
        Self(bytes)
    }
}
