//! Splits an image into frame-sized chunks.
//!
//! Chunk `i` covers `[i * size, min((i + 1) * size, total))`. The last chunk
//! is short when `total` is not a multiple of `size`; nothing is ever emitted
//! past `total`. Indices are `u32` and chunk counts are computed in `u64`, so
//! neither can wrap for an image whose length fits `u32`.

use thiserror::Error;

use crate::protocol::MAX_XFER;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("Chunk size {size} outside 1..={max}")]
    InvalidChunkSize { size: usize, max: usize },
}

/// One contiguous slice of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: u32,
    pub offset: u32,
    pub data: &'a [u8],
}

impl Chunk<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this chunk.
    pub fn end(&self) -> u32 {
        self.offset + self.data.len() as u32
    }
}

/// Chunking plan for one image length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    total: u32,
    size: u32,
}

impl Chunker {
    pub fn new(total: u32, size: usize) -> Result<Self, ChunkerError> {
        if size == 0 || size > MAX_XFER {
            return Err(ChunkerError::InvalidChunkSize {
                size,
                max: MAX_XFER,
            });
        }
        Ok(Self {
            total,
            size: size as u32,
        })
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn chunk_size(&self) -> usize {
        self.size as usize
    }

    /// Number of chunks, including a short final one.
    pub fn count(&self) -> u32 {
        (u64::from(self.total).div_ceil(u64::from(self.size))) as u32
    }

    /// Length of the final chunk, or 0 for an empty image.
    pub fn last_len(&self) -> usize {
        match self.total % self.size {
            0 if self.total == 0 => 0,
            0 => self.size as usize,
            rem => rem as usize,
        }
    }

    /// Chunk that starts at `offset`, or `None` at or past the end.
    ///
    /// `offset` must be chunk-aligned; `data` must be the image this plan was
    /// built for.
    pub fn chunk_at<'a>(&self, data: &'a [u8], offset: u32) -> Option<Chunk<'a>> {
        if offset >= self.total || offset % self.size != 0 {
            return None;
        }
        let remaining = self.total - offset;
        let len = remaining.min(self.size);
        let end = offset.checked_add(len)?;
        let slice = data.get(offset as usize..end as usize)?;
        Some(Chunk {
            index: offset / self.size,
            offset,
            data: slice,
        })
    }

    /// Lazy iterator over every chunk of `data`.
    pub fn iter<'a>(&self, data: &'a [u8]) -> Chunks<'a> {
        Chunks {
            plan: *self,
            data,
            next_index: 0,
        }
    }
}

/// Restartable chunk iterator.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    plan: Chunker,
    data: &'a [u8],
    next_index: u32,
}

impl Chunks<'_> {
    /// Rewind to the first chunk.
    pub fn reset(&mut self) {
        self.next_index = 0;
    }

    /// Index of the chunk the next call to `next` returns.
    pub fn position(&self) -> u32 {
        self.next_index
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.plan.count() {
            return None;
        }
        let offset = u64::from(self.next_index) * u64::from(self.plan.size);
        let chunk = self.plan.chunk_at(self.data, offset as u32)?;
        self.next_index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.plan.count() - self.next_index.min(self.plan.count())) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks<'_> {}
