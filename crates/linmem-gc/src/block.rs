//! Block header encoding.
//!
//! ## Layout
//!
//! ```text
//! allocated block:                  free block:
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │ header: size | flags     │      │ header: size | flags     │
//! ├──────────────────────────┤      ├──────────────────────────┤
//! │ data (returned pointer)  │      │ next free block (or 0)   │
//! │ ...                      │      │ prev free block (or 0)   │
//! │                          │      │ unused                   │
//! └──────────────────────────┘      └──────────────────────────┘
//! ```
//!
//! The header word is `size:61 | reserved:1 | is_object:1 | allocated:1`.
//! Sizes are always multiples of 8, so the low three bits are free for flags.

use std::fmt;

use crate::address::{Address, WORD_SIZE, checked_align_up};

/// Size of a block header.
pub const HEADER_SIZE: usize = WORD_SIZE;

/// Smallest data area: room for the two free-list links.
pub const MIN_INNER_SIZE: usize = 2 * WORD_SIZE;

/// Smallest block, header included.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + MIN_INNER_SIZE;

/// Block alignment.
pub const BLOCK_ALIGN: usize = 8;

const ALLOCATED_BIT: u64 = 0b001;
const IS_OBJECT_BIT: u64 = 0b010;
const RESERVED_BIT: u64 = 0b100;
const FLAG_MASK: u64 = 0b111;

/// Offset of the `next` link inside a free block.
pub const NEXT_LINK_OFFSET: usize = HEADER_SIZE;

/// Offset of the `prev` link inside a free block.
pub const PREV_LINK_OFFSET: usize = HEADER_SIZE + WORD_SIZE;

/// Decoded block header word.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader(u64);

impl BlockHeader {
    /// Header for a block of `size` bytes.
    #[inline]
    pub const fn new(size: usize, allocated: bool, is_object: bool) -> Self {
        debug_assert!(size as u64 & FLAG_MASK == 0, "block size must be 8-byte aligned");
        let mut raw = size as u64;
        if allocated {
            raw |= ALLOCATED_BIT;
        }
        if is_object {
            raw |= IS_OBJECT_BIT;
        }
        Self(raw)
    }

    /// Header for a free block.
    #[inline]
    pub const fn free(size: usize) -> Self {
        Self::new(size, false, false)
    }

    /// Wrap a raw header word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw header word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Total block size, header included.
    #[inline]
    pub const fn size(self) -> usize {
        (self.0 & !FLAG_MASK) as usize
    }

    /// Size of the data area.
    #[inline]
    pub const fn inner_size(self) -> usize {
        self.size().saturating_sub(HEADER_SIZE)
    }

    /// Whether the block is handed out.
    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }

    /// Whether the block holds a managed object.
    #[inline]
    pub const fn is_object(self) -> bool {
        self.0 & IS_OBJECT_BIT != 0
    }

    /// Whether the reserved bit is set (never, in a healthy heap).
    #[inline]
    pub const fn has_reserved_bit(self) -> bool {
        self.0 & RESERVED_BIT != 0
    }

    /// Same flags, different size.
    #[inline]
    pub const fn with_size(self, size: usize) -> Self {
        debug_assert!(size as u64 & FLAG_MASK == 0, "block size must be 8-byte aligned");
        Self(size as u64 | (self.0 & FLAG_MASK))
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .field("is_object", &self.is_object())
            .finish()
    }
}

/// Data pointer of the block at `block`.
#[inline]
pub const fn inner_of(block: Address) -> Address {
    block.add(HEADER_SIZE)
}

/// Block that owns the data pointer `inner`.
#[inline]
#[track_caller]
pub const fn block_of(inner: Address) -> Address {
    inner.sub(HEADER_SIZE)
}

/// Data size actually reserved for a request of `requested` bytes.
///
/// At least [`MIN_INNER_SIZE`] and 8-byte aligned; `None` on overflow.
#[inline]
pub const fn padded_inner_size(requested: usize) -> Option<usize> {
    let size = if requested < MIN_INNER_SIZE {
        MIN_INNER_SIZE
    } else {
        requested
    };
    checked_align_up(size, BLOCK_ALIGN)
}
