//! Tag Allocation.
//!
//! Tags are handed out smallest-first. Tags below the high-water mark that
//! have been released are kept in an ordered set; everything at or above
//! the mark has never been used since it last dropped.

use std::collections::BTreeSet;

use crate::common::{EngineError, Tag};

/// Smallest-free tag allocator over `[0, limit)`.
#[derive(Clone, Debug)]
pub struct TagAllocator {
    limit: u32,
    watermark: u32,
    released: BTreeSet<u16>,
}

impl TagAllocator {
    /// Creates an allocator over a tag space of `bits` bits.
    pub fn with_bits(bits: u32) -> Self {
        Self::with_limit(1u32 << bits)
    }

    /// Creates an allocator over `[0, limit)`.
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: limit.min(u16::MAX as u32 + 1),
            watermark: 0,
            released: BTreeSet::new(),
        }
    }

    /// Returns `true` if at least one tag is free.
    pub fn has_free(&self) -> bool {
        !self.released.is_empty() || self.watermark < self.limit
    }

    /// Returns the number of tags currently in use.
    pub fn in_use(&self) -> usize {
        self.watermark as usize - self.released.len()
    }

    /// Allocates the smallest unused tag.
    pub fn allocate(&mut self) -> Result<Tag, EngineError> {
        if let Some(tag) = self.released.pop_first() {
            return Ok(Tag(tag));
        }
        if self.watermark >= self.limit {
            return Err(EngineError::TagsExhausted { limit: self.limit });
        }
        let tag = self.watermark as u16;
        self.watermark += 1;
        Ok(Tag(tag))
    }

    /// Returns a tag to the free set.
    pub fn release(&mut self, tag: Tag) {
        let raw = tag.val() as u32;
        if raw >= self.watermark {
            return;
        }
        self.released.insert(tag.val());
        while self.watermark > 0 && self.released.remove(&((self.watermark - 1) as u16)) {
            self.watermark -= 1;
        }
    }
}
