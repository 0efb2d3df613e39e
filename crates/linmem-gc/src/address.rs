//! Addresses inside the linear memory.
//!
//! An [`Address`] is a byte offset from the start of the region. Offset 0 sits
//! in the zero guard page, so it doubles as the null pointer everywhere a word
//! of memory holds a link or a reference.

use std::fmt;

/// Size of a machine word stored in linear memory.
pub const WORD_SIZE: usize = 8;

/// Byte offset into the linear memory.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    /// The null address (inside the guard page).
    pub const NULL: Address = Address(0);

    /// Create an address from a raw offset.
    #[inline]
    pub const fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// Decode an address stored in a memory word.
    #[inline]
    pub const fn from_word(word: u64) -> Self {
        Self(word as usize)
    }

    /// Raw offset.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Encode as a memory word.
    #[inline]
    pub const fn to_word(self) -> u64 {
        self.0 as u64
    }

    /// True for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    ///
    /// # Panics
    /// Panics on overflow.
    #[inline]
    #[track_caller]
    pub const fn add(self, bytes: usize) -> Self {
        match self.0.checked_add(bytes) {
            Some(v) => Self(v),
            None => panic!("address overflow"),
        }
    }

    /// Address `bytes` past this one, or `None` on overflow.
    #[inline]
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Address `bytes` before this one.
    ///
    /// # Panics
    /// Panics on underflow.
    #[inline]
    #[track_caller]
    pub const fn sub(self, bytes: usize) -> Self {
        match self.0.checked_sub(bytes) {
            Some(v) => Self(v),
            None => panic!("address underflow"),
        }
    }

    /// Distance in bytes from `base` up to this address.
    #[inline]
    #[track_caller]
    pub const fn offset_from(self, base: Address) -> usize {
        match self.0.checked_sub(base.0) {
            Some(v) => v,
            None => panic!("address below base"),
        }
    }

    /// Round up to a multiple of `align` (a power of two).
    #[inline]
    pub const fn align_up(self, align: usize) -> Self {
        Self(align_up(self.0, align))
    }

    /// True if this address is a multiple of `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }
}

/// Round `value` up to a multiple of `align`, which must be a power of two.
///
/// # Panics
/// Panics if the rounded value overflows.
#[inline]
#[track_caller]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    match checked_align_up(value, align) {
        Some(v) => v,
        None => panic!("alignment overflow"),
    }
}

/// Round `value` up to a multiple of `align`, or `None` on overflow.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(checked_align_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_address_arithmetic() {
        let a = Address::new(0x1000);
        assert_eq!(a.add(8).as_usize(), 0x1008);
        assert_eq!(a.add(8).sub(8), a);
        assert_eq!(a.add(24).offset_from(a), 24);
        assert!(a.is_aligned(4096));
        assert!(!a.add(4).is_aligned(8));
        assert!(Address::NULL.is_null());
        assert_eq!(Address::from_word(a.to_word()), a);
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new(255).to_string(), "0xff");
        assert_eq!(format!("{:?}", Address::new(16)), "Address(0x10)");
    }
}
