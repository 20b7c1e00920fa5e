//! CH55x bootloader command frames.
//!
//! ## Frame Format
//!
//! Both protocol generations use an opcode followed by a length field and a
//! command-specific body. They differ in the width of the length field and in
//! what the length counts.
//!
//! ```text
//! V1 (bootloader 1.x)
//! +--------+--------+---------------------------+
//! | Opcode | Length |           Body            |
//! +--------+--------+---------------------------+
//! | 1 byte | 1 byte |  variable (data frames    |
//! |        |        |  are zero-filled to 64 B) |
//! +--------+--------+---------------------------+
//!
//! V2 (bootloader 2.31+)
//! +--------+---------+--------------------------+
//! | Opcode | Length  |           Body           |
//! +--------+---------+--------------------------+
//! | 1 byte | 2 bytes |  Length bytes            |
//! |        |   LE    |                          |
//! +--------+---------+--------------------------+
//! ```
//!
//! V2 replies have the layout `opcode, 0x00, len_lo, len_hi, data...`. V1
//! replies carry no header at all.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::protocol::checksum::sum8;
use crate::protocol::version::ProtocolVersion;
use crate::target::chip::BootloaderVersion;

/// Size of a full USB packet; V1 data frames are always this long.
pub const PACKET_SIZE: usize = 64;

/// Length of the random seed sent with `IspKey`.
pub const KEY_SEED_LEN: usize = 0x30;

/// Config mask requesting every config field.
const CONFIG_MASK: u8 = 0x1F;

/// Header bytes of a V2 reply (`opcode, status, len_lo, len_hi`).
pub const V2_REPLY_HEADER: usize = 4;

/// Body of the V1 identify command.
const V1_IDENTIFY_BODY: &[u8; 20] = b"USB DBG CH559 & ISP\0";

/// Declared length of the V1 identify command (excludes the trailing NUL).
const V1_IDENTIFY_LEN: u16 = 0x13;

/// Body of the V2 identify command: expected chip id, family, vendor string.
const V2_IDENTIFY_BODY: &[u8; 18] = b"\x59\x11MCU ISP & WCH.CN";

/// Command opcodes.
pub mod opcode {
    /// Bootloader 1.x opcodes.
    pub mod v1 {
        /// Identify chip.
        pub const IDENTIFY: u8 = 0xA2;
        /// Read bootloader version.
        pub const READ_CONFIG: u8 = 0xBB;
        /// Unlock flash for erase.
        pub const ERASE: u8 = 0xA6;
        /// Erase one 1 KiB block.
        pub const ERASE_BLOCK: u8 = 0xA9;
        /// Program data.
        pub const WRITE: u8 = 0xA8;
        /// Compare data.
        pub const VERIFY: u8 = 0xA7;
        /// Leave the bootloader.
        pub const EXIT: u8 = 0xA5;
    }

    /// Bootloader 2.31+ opcodes.
    pub mod v2 {
        /// Identify chip.
        pub const IDENTIFY: u8 = 0xA1;
        /// Leave the bootloader.
        pub const EXIT: u8 = 0xA2;
        /// Send the bootkey seed.
        pub const ISP_KEY: u8 = 0xA3;
        /// Erase code flash.
        pub const ERASE: u8 = 0xA4;
        /// Program data.
        pub const WRITE: u8 = 0xA5;
        /// Compare data.
        pub const VERIFY: u8 = 0xA6;
        /// Read config block and bootloader version.
        pub const READ_CONFIG: u8 = 0xA7;
    }
}

/// Logical bootloader command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Identify chip (also the first frame of detect).
    Identify,
    /// Read bootloader version (and, on V2, the config block).
    ReadConfig,
    /// Send the bootkey seed (V2 only).
    IspKey {
        /// Seed bytes the bootkey is derived from.
        seed: Vec<u8>,
    },
    /// Erase code flash. V1 ignores `units`.
    Erase {
        /// Sector count (V2).
        units: u8,
    },
    /// Erase a single 1 KiB block (V1 only).
    EraseBlock {
        /// Block index.
        block: u8,
    },
    /// Program `data` at `offset`.
    Write {
        /// Flash offset.
        offset: u32,
        /// Filler byte the bootloader ignores (V2 only).
        pad: u8,
        /// Payload as sent on the wire (already scrambled on V2).
        data: Vec<u8>,
    },
    /// Compare flash at `offset` with `data`.
    Verify {
        /// Flash offset.
        offset: u32,
        /// Filler byte the bootloader ignores (V2 only).
        pad: u8,
        /// Payload as sent on the wire (already scrambled on V2).
        data: Vec<u8>,
    },
    /// Leave the bootloader and run the application.
    Exit,
}

impl Command {
    /// Opcode of this command for the given protocol version.
    pub fn opcode(&self, version: ProtocolVersion) -> Result<u8> {
        use opcode::{v1, v2};

        let op = match (version, self) {
            (ProtocolVersion::V1, Self::Identify) => v1::IDENTIFY,
            (ProtocolVersion::V1, Self::ReadConfig) => v1::READ_CONFIG,
            (ProtocolVersion::V1, Self::Erase { .. }) => v1::ERASE,
            (ProtocolVersion::V1, Self::EraseBlock { .. }) => v1::ERASE_BLOCK,
            (ProtocolVersion::V1, Self::Write { .. }) => v1::WRITE,
            (ProtocolVersion::V1, Self::Verify { .. }) => v1::VERIFY,
            (ProtocolVersion::V1, Self::Exit) => v1::EXIT,
            (ProtocolVersion::V2, Self::Identify) => v2::IDENTIFY,
            (ProtocolVersion::V2, Self::ReadConfig) => v2::READ_CONFIG,
            (ProtocolVersion::V2, Self::IspKey { .. }) => v2::ISP_KEY,
            (ProtocolVersion::V2, Self::Erase { .. }) => v2::ERASE,
            (ProtocolVersion::V2, Self::Write { .. }) => v2::WRITE,
            (ProtocolVersion::V2, Self::Verify { .. }) => v2::VERIFY,
            (ProtocolVersion::V2, Self::Exit) => v2::EXIT,
            (ProtocolVersion::V1, Self::IspKey { .. })
            | (ProtocolVersion::V2, Self::EraseBlock { .. }) => {
                return Err(Error::Unsupported(format!(
                    "{} is not a {version} command",
                    self.name()
                )));
            },
        };
        Ok(op)
    }

    /// Short human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify => "identify",
            Self::ReadConfig => "read-config",
            Self::IspKey { .. } => "isp-key",
            Self::Erase { .. } => "erase",
            Self::EraseBlock { .. } => "erase-block",
            Self::Write { .. } => "write",
            Self::Verify { .. } => "verify",
            Self::Exit => "exit",
        }
    }

    /// Build the wire frame for this command.
    pub fn to_frame(&self, version: ProtocolVersion) -> Result<Frame> {
        let opcode = self.opcode(version)?;

        let frame = match (version, self) {
            (ProtocolVersion::V1, Self::Identify) => {
                Frame::new(opcode, V1_IDENTIFY_LEN, V1_IDENTIFY_BODY.to_vec())
            },
            (ProtocolVersion::V2, Self::Identify) => Frame::with_body(opcode, V2_IDENTIFY_BODY.to_vec()),
            (ProtocolVersion::V1, Self::ReadConfig) => Frame::with_body(opcode, Vec::new()),
            (ProtocolVersion::V2, Self::ReadConfig) => {
                Frame::with_body(opcode, vec![CONFIG_MASK, 0x00])
            },
            (_, Self::IspKey { seed }) => Frame::with_body(opcode, seed.clone()),
            (ProtocolVersion::V1, Self::Erase { .. }) => {
                Frame::with_body(opcode, vec![0x00; 4])
            },
            (ProtocolVersion::V2, Self::Erase { units }) => Frame::with_body(opcode, vec![*units]),
            (_, Self::EraseBlock { block }) => {
                let addr = u16::try_from(u32::from(*block) * 1024).map_err(|_| {
                    Error::Unsupported(format!("erase block {block} is beyond 64 KiB"))
                })?;
                let mut body = vec![0u8; 2];
                LittleEndian::write_u16(&mut body, addr);
                Frame::with_body(opcode, body)
            },
            (_, Self::Write { offset, pad, data } | Self::Verify { offset, pad, data }) => {
                let max = version.max_write_chunk();
                if data.len() > max {
                    return Err(Error::InvalidChunkSize {
                        len: data.len(),
                        max,
                    });
                }
                data_frame(version, opcode, *offset, *pad, data)?
            },
            (ProtocolVersion::V1, Self::Exit) => Frame::with_body(opcode, vec![0x01, 0x00]),
            (ProtocolVersion::V2, Self::Exit) => Frame::with_body(opcode, vec![0x01]),
        };

        Ok(frame)
    }

    /// Parse a command frame (the inverse of [`encode`]).
    pub fn parse(raw: &[u8], version: ProtocolVersion) -> Result<Self> {
        use opcode::{v1, v2};

        let frame = Frame::from_bytes(raw, version)?;
        let body = frame.body.as_slice();

        let cmd = match (version, frame.opcode) {
            (ProtocolVersion::V1, v1::IDENTIFY) | (ProtocolVersion::V2, v2::IDENTIFY) => {
                Self::Identify
            },
            (ProtocolVersion::V1, v1::READ_CONFIG) | (ProtocolVersion::V2, v2::READ_CONFIG) => {
                Self::ReadConfig
            },
            (ProtocolVersion::V1, v1::EXIT) | (ProtocolVersion::V2, v2::EXIT) => Self::Exit,
            (ProtocolVersion::V1, v1::ERASE) => Self::Erase { units: 0 },
            (ProtocolVersion::V2, v2::ERASE) => Self::Erase {
                units: *body
                    .first()
                    .ok_or_else(|| malformed("erase frame without sector count"))?,
            },
            (ProtocolVersion::V1, v1::ERASE_BLOCK) => {
                if body.len() < 2 {
                    return Err(malformed("erase-block frame too short"));
                }
                let block = LittleEndian::read_u16(body) / 1024;
                Self::EraseBlock {
                    block: u8::try_from(block).map_err(|_| malformed("erase block out of range"))?,
                }
            },
            (ProtocolVersion::V2, v2::ISP_KEY) => Self::IspKey {
                seed: body.to_vec(),
            },
            (ProtocolVersion::V1, op @ (v1::WRITE | v1::VERIFY)) => {
                let len = usize::from(frame.length);
                if body.len() < 2 + len {
                    return Err(malformed("V1 data frame shorter than its length field"));
                }
                let offset = u32::from(LittleEndian::read_u16(body));
                let data = body[2..2 + len].to_vec();
                if op == v1::WRITE {
                    Self::Write {
                        offset,
                        pad: 0,
                        data,
                    }
                } else {
                    Self::Verify {
                        offset,
                        pad: 0,
                        data,
                    }
                }
            },
            (ProtocolVersion::V2, op @ (v2::WRITE | v2::VERIFY)) => {
                if body.len() < 5 {
                    return Err(malformed("V2 data frame shorter than its header"));
                }
                let offset = LittleEndian::read_u32(body);
                let pad = body[4];
                let data = body[5..].to_vec();
                if op == v2::WRITE {
                    Self::Write { offset, pad, data }
                } else {
                    Self::Verify { offset, pad, data }
                }
            },
            (_, op) => {
                return Err(Error::Unsupported(format!(
                    "unknown {version} opcode {op:#04x}"
                )));
            },
        };

        Ok(cmd)
    }
}

/// Build the frame of a write or verify command.
fn data_frame(
    version: ProtocolVersion,
    opcode: u8,
    offset: u32,
    pad: u8,
    data: &[u8],
) -> Result<Frame> {
    match version {
        ProtocolVersion::V1 => {
            let addr = u16::try_from(offset).map_err(|_| {
                Error::Unsupported(format!("offset {offset:#x} is beyond 64 KiB"))
            })?;
            // Frame = opcode + length + body, always one full packet
            let mut body = vec![0u8; PACKET_SIZE - 2];
            LittleEndian::write_u16(&mut body, addr);
            body[2..2 + data.len()].copy_from_slice(data);
            // Safe cast: data.len() <= max chunk (60)
            #[allow(clippy::cast_possible_truncation)]
            let length = data.len() as u16;
            Ok(Frame::new(opcode, length, body))
        },
        ProtocolVersion::V2 => {
            let mut body = Vec::with_capacity(5 + data.len());
            let mut addr = [0u8; 4];
            LittleEndian::write_u32(&mut addr, offset);
            body.extend_from_slice(&addr);
            body.push(pad);
            body.extend_from_slice(data);
            Ok(Frame::with_body(opcode, body))
        },
    }
}

fn malformed(msg: &str) -> Error {
    Error::MalformedResponse(msg.to_string())
}

/// Wire representation of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command opcode.
    pub opcode: u8,
    /// Value of the length field.
    pub length: u16,
    /// Bytes following the length field.
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame with an explicit length field.
    pub fn new(opcode: u8, length: u16, body: Vec<u8>) -> Self {
        Self {
            opcode,
            length,
            body,
        }
    }

    /// Create a frame whose length field counts the body.
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_body(opcode: u8, body: Vec<u8>) -> Self {
        // Safe cast: bodies never exceed one USB packet
        Self::new(opcode, body.len() as u16, body)
    }

    /// Serialize the frame.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.body.len());
        buf.push(self.opcode);
        match version {
            // Safe cast: V1 lengths fit one byte
            ProtocolVersion::V1 => buf.push(self.length as u8),
            ProtocolVersion::V2 => {
                let mut len = [0u8; 2];
                LittleEndian::write_u16(&mut len, self.length);
                buf.extend_from_slice(&len);
            },
        }
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Split raw bytes into opcode, length and body.
    pub fn from_bytes(raw: &[u8], version: ProtocolVersion) -> Result<Self> {
        match version {
            ProtocolVersion::V1 => {
                if raw.len() < 2 {
                    return Err(malformed("V1 frame shorter than 2 bytes"));
                }
                Ok(Self::new(raw[0], u16::from(raw[1]), raw[2..].to_vec()))
            },
            ProtocolVersion::V2 => {
                if raw.len() < 3 {
                    return Err(malformed("V2 frame shorter than 3 bytes"));
                }
                let length = LittleEndian::read_u16(&raw[1..3]);
                Ok(Self::new(raw[0], length, raw[3..].to_vec()))
            },
        }
    }

    /// 8-bit sum over the serialized frame, as carried by the UART link.
    pub fn checksum(&self, version: ProtocolVersion) -> u8 {
        sum8(&self.to_bytes(version))
    }
}

/// Encode a command into the exact bytes the bootloader expects.
pub fn encode(command: &Command, version: ProtocolVersion) -> Result<Vec<u8>> {
    Ok(command
        .to_frame(version)?
        .to_bytes(version))
}

/// Decoded bootloader reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Identify reply.
    Identity {
        /// Chip id byte.
        chip_id: u8,
        /// Chip family byte (V2 only).
        family: Option<u8>,
    },
    /// Config reply.
    Config {
        /// Bootloader version.
        version: BootloaderVersion,
        /// Checksum of the unique id bytes, seeding the bootkey (V2 only).
        seed_sum: Option<u8>,
    },
    /// Key acceptance; carries the bootloader's bootkey checksum.
    KeyAccepted {
        /// Checksum computed by the chip.
        checksum: u8,
    },
    /// Plain status reply.
    Status(u8),
}

impl Reply {
    /// Whether this reply acknowledges the command.
    pub fn is_ack(&self, version: ProtocolVersion) -> bool {
        match self {
            Self::Status(status) => version.is_ack(*status),
            _ => true,
        }
    }

    /// Status byte of a plain status reply.
    pub fn status(&self) -> Option<u8> {
        match self {
            Self::Status(status) => Some(*status),
            _ => None,
        }
    }
}

/// Format bytes as colon-separated lowercase hex (`a1:12:00`).
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Minimum data length of a V2 config reply.
const V2_CONFIG_MIN: usize = 22;

/// Decode the reply to `expected`.
pub fn decode(raw: &[u8], expected: &Command, version: ProtocolVersion) -> Result<Reply> {
    match version {
        ProtocolVersion::V1 => decode_v1(raw, expected),
        ProtocolVersion::V2 => decode_v2(raw, expected),
    }
}

fn decode_v1(raw: &[u8], expected: &Command) -> Result<Reply> {
    match expected {
        Command::Identify | Command::ReadConfig if raw.len() != 2 => Err(Error::MalformedResponse(
            format!("{} reply must be 2 bytes, got {}", expected.name(), raw.len()),
        )),
        Command::Identify => Ok(Reply::Identity {
            chip_id: raw[0],
            family: None,
        }),
        Command::ReadConfig => Ok(Reply::Config {
            version: BootloaderVersion::from_nibbles(raw[0]),
            seed_sum: None,
        }),
        Command::IspKey { .. } => Err(Error::Unsupported("isp-key is not a V1 command".into())),
        _ => raw
            .first()
            .map(|&status| Reply::Status(status))
            .ok_or_else(|| malformed("empty reply")),
    }
}

fn decode_v2(raw: &[u8], expected: &Command) -> Result<Reply> {
    if raw.len() < V2_REPLY_HEADER {
        return Err(Error::MalformedResponse(format!(
            "reply of {} bytes is shorter than the header",
            raw.len()
        )));
    }

    let expected_op = expected.opcode(ProtocolVersion::V2)?;
    if raw[0] != expected_op {
        return Err(Error::UnexpectedOpcode {
            expected: expected_op,
            actual: raw[0],
        });
    }

    let declared = usize::from(LittleEndian::read_u16(&raw[2..4]));
    let data = &raw[V2_REPLY_HEADER..];
    if declared != data.len() {
        return Err(Error::MalformedResponse(format!(
            "length field says {declared} bytes, frame carries {}",
            data.len()
        )));
    }

    let min = match expected {
        Command::Identify => 2,
        Command::ReadConfig => V2_CONFIG_MIN,
        Command::Exit => 0,
        _ => 1,
    };
    if data.len() < min {
        return Err(Error::MalformedResponse(format!(
            "{} reply needs {min} data bytes, got {}",
            expected.name(),
            data.len()
        )));
    }

    let reply = match expected {
        Command::Identify => Reply::Identity {
            chip_id: data[0],
            family: Some(data[1]),
        },
        Command::ReadConfig => Reply::Config {
            version: BootloaderVersion::new(data[15], data[16], data[17]),
            seed_sum: Some(sum8(&data[18..22])),
        },
        Command::IspKey { .. } => Reply::KeyAccepted { checksum: data[0] },
        _ => Reply::Status(data.first().copied().unwrap_or(0)),
    };
    Ok(reply)
}
