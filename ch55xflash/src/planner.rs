//! Chunk planning.
//!
//! Splits a firmware image into the ordered sequence of write or verify
//! chunks the bootloader accepts. Chunks are produced lazily, one per round
//! trip.

use crate::error::{Error, Result};
use crate::protocol::version::ChunkKind;
use crate::target::chip::FlashLayout;

/// One slice of the image, transferred in a single round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Flash offset of the first byte.
    pub offset: u32,
    /// Bytes to transfer, including any padding.
    pub payload: Vec<u8>,
    /// Number of leading payload bytes taken from the image.
    pub image_len: usize,
}

impl Chunk {
    /// Padding bytes appended after the image data.
    pub fn padding(&self) -> &[u8] {
        &self.payload[self.image_len..]
    }
}

/// Lazy, ordered chunk sequence over an image.
#[derive(Debug, Clone)]
pub struct ChunkPlan<'a> {
    image: &'a [u8],
    max_chunk: usize,
    block_align: usize,
    fill_byte: u8,
    pos: usize,
}

impl ChunkPlan<'_> {
    /// Total number of chunks in the plan.
    pub fn chunk_count(&self) -> usize {
        self.image.len().div_ceil(self.max_chunk)
    }

    /// Number of image bytes the plan covers.
    pub fn image_len(&self) -> usize {
        self.image.len()
    }
}

impl Iterator for ChunkPlan<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.pos >= self.image.len() {
            return None;
        }

        let end = (self.pos + self.max_chunk).min(self.image.len());
        let mut payload = self.image[self.pos..end].to_vec();
        let image_len = payload.len();

        // Only the final chunk can be short; fixed-block protocols pad it.
        let padded = image_len.next_multiple_of(self.block_align);
        payload.resize(padded, self.fill_byte);

        // Safe cast: images are bounded by the 64 KiB flash
        #[allow(clippy::cast_possible_truncation)]
        let offset = self.pos as u32;
        self.pos = end;

        Some(Chunk {
            offset,
            payload,
            image_len,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.image.len() - self.pos.min(self.image.len())).div_ceil(self.max_chunk);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkPlan<'_> {}

/// Plan the chunks for writing or verifying `image`.
pub fn plan<'a>(image: &'a [u8], layout: &FlashLayout, kind: ChunkKind) -> Result<ChunkPlan<'a>> {
    if image.len() > layout.total_size {
        return Err(Error::ImageTooLarge {
            len: image.len(),
            capacity: layout.total_size,
        });
    }

    let max_chunk = layout.max_chunk(kind);
    let block_align = layout.block_align.max(1);
    if max_chunk == 0 || max_chunk % block_align != 0 {
        return Err(Error::InvalidChunkSize {
            len: max_chunk,
            max: max_chunk - max_chunk % block_align,
        });
    }

    Ok(ChunkPlan {
        image,
        max_chunk,
        block_align,
        fill_byte: layout.fill_byte,
        pos: 0,
    })
}
