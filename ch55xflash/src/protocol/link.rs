//! UART link framing.
//!
//! Over a serial line every V2 frame is wrapped with a direction-specific
//! preamble and a trailing 8-bit sum of the frame bytes:
//!
//! ```text
//! host -> chip:  57 AB | frame | sum8(frame)
//! chip -> host:  55 AA | reply | sum8(reply)
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::protocol::checksum::sum8;
use crate::protocol::frame::V2_REPLY_HEADER;

/// Preamble of frames sent by the host.
pub const HOST_PREAMBLE: [u8; 2] = [0x57, 0xAB];

/// Preamble of frames sent by the chip.
pub const DEVICE_PREAMBLE: [u8; 2] = [0x55, 0xAA];

/// Framing overhead: preamble plus checksum.
pub const OVERHEAD: usize = 3;

fn wrap_with(preamble: [u8; 2], frame: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame.len() + OVERHEAD);
    buf.extend_from_slice(&preamble);
    buf.extend_from_slice(frame);
    buf.push(sum8(frame));
    buf
}

fn unwrap_with(preamble: [u8; 2], raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < OVERHEAD {
        return Err(Error::MalformedResponse(format!(
            "link frame of {} bytes is too short",
            raw.len()
        )));
    }
    if raw[..2] != preamble {
        return Err(Error::MalformedResponse(format!(
            "bad link preamble {:02x} {:02x}",
            raw[0], raw[1]
        )));
    }

    let (body, trailer) = raw[2..].split_at(raw.len() - OVERHEAD);
    let expected = sum8(body);
    if trailer[0] != expected {
        return Err(Error::ChecksumMismatch {
            expected,
            actual: trailer[0],
        });
    }
    Ok(body.to_vec())
}

/// Wrap a command frame for transmission to the chip.
pub fn wrap(frame: &[u8]) -> Vec<u8> {
    wrap_with(HOST_PREAMBLE, frame)
}

/// Validate and strip the framing of a reply from the chip.
pub fn unwrap(raw: &[u8]) -> Result<Vec<u8>> {
    unwrap_with(DEVICE_PREAMBLE, raw)
}

/// Wrap a reply the way the chip does (used by simulated devices).
pub fn wrap_reply(reply: &[u8]) -> Vec<u8> {
    wrap_with(DEVICE_PREAMBLE, reply)
}

/// Validate and strip the framing of a host frame (used by simulated devices).
pub fn unwrap_request(raw: &[u8]) -> Result<Vec<u8>> {
    unwrap_with(HOST_PREAMBLE, raw)
}

/// Bytes to read before the total reply length is known.
pub const REPLY_HEAD_LEN: usize = 2 + V2_REPLY_HEADER;

/// Total link frame length announced by the first [`REPLY_HEAD_LEN`] bytes.
pub fn reply_frame_len(head: &[u8]) -> Option<usize> {
    if head.len() < REPLY_HEAD_LEN {
        return None;
    }
    let data_len = usize::from(LittleEndian::read_u16(&head[4..6]));
    Some(REPLY_HEAD_LEN + data_len + 1)
}
