//! Object color header
//!
//! The first word of every managed object is the address of its type
//! descriptor. Descriptors are 8-byte aligned, so the low three bits of that
//! word are free; two of them carry the tri-color mark:
//!
//! ```text
//! ┌────────────────────────────────────────────┬──────────┬───────┐
//! │ type descriptor address (bits 63..3)       │ reserved │ color │
//! └────────────────────────────────────────────┴──────────┴───────┘
//!                                                 bit 2     bits 1..0
//! ```
//!
//! Objects in the immutable image are never written here; they are always
//! treated as Black.

use crate::address::Address;

const COLOR_MASK: u64 = 0b011;
const LOW_BITS_MASK: u64 = 0b111;

/// Mark color for tri-color marking
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Not yet visited (garbage after marking)
    White = 0,
    /// Discovered, references not yet scanned
    Gray = 1,
    /// Fully scanned
    Black = 2,
}

/// Type-descriptor word with color bits.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorHeader(u64);

impl ColorHeader {
    /// White header for an object of the given type.
    #[inline]
    pub const fn new(type_descriptor: Address) -> Self {
        debug_assert!(
            type_descriptor.to_word() & LOW_BITS_MASK == 0,
            "type descriptor must be 8-byte aligned"
        );
        Self(type_descriptor.to_word())
    }

    /// Wrap a raw header word read from memory.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw header word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Decode the color bits.
    #[inline]
    pub const fn color(self) -> Color {
        match self.0 & COLOR_MASK {
            0 => Color::White,
            1 => Color::Gray,
            _ => Color::Black,
        }
    }

    /// True when the object has not been reached.
    #[inline]
    pub const fn is_white(self) -> bool {
        matches!(self.color(), Color::White)
    }

    /// True when the object is reached but not scanned.
    #[inline]
    pub const fn is_gray(self) -> bool {
        matches!(self.color(), Color::Gray)
    }

    /// True when the object is fully scanned.
    #[inline]
    pub const fn is_black(self) -> bool {
        matches!(self.color(), Color::Black)
    }

    /// Same descriptor, given color.
    #[inline]
    pub const fn with_color(self, color: Color) -> Self {
        Self((self.0 & !COLOR_MASK) | color as u64)
    }

    /// Same descriptor, White.
    #[inline]
    pub const fn mark_white(self) -> Self {
        self.with_color(Color::White)
    }

    /// Same descriptor, Gray.
    #[inline]
    pub const fn mark_gray(self) -> Self {
        self.with_color(Color::Gray)
    }

    /// Same descriptor, Black.
    #[inline]
    pub const fn mark_black(self) -> Self {
        self.with_color(Color::Black)
    }

    /// The type descriptor address with the status bits masked off.
    #[inline]
    pub const fn type_descriptor(self) -> Address {
        Address::from_word(self.0 & !LOW_BITS_MASK)
    }
}
