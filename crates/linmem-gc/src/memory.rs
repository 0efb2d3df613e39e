//! The linear memory itself and word-level access to it.
//!
//! The region is a single byte array that only grows, in whole pages. The
//! host primitive that grows it is the [`RegionHost`] trait; [`LinearMemory`]
//! is the in-process host used by the runtime and the tests.
//!
//! All word access is little-endian `u64`. Indexing goes through slices, so
//! every access is bounds checked; word alignment is checked in debug builds.

use std::cell::Cell;

use crate::address::{Address, WORD_SIZE};

/// WebAssembly page size (64KB).
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Host primitive that owns the bytes of the region and grows it by pages.
pub trait RegionHost {
    /// Size of one page in bytes (a power of two).
    fn page_size(&self) -> usize;

    /// Current number of pages.
    fn page_count(&self) -> usize;

    /// Grow the region by `pages` pages.
    ///
    /// Returns the previous page count, or `None` if the host refuses.
    fn grow(&mut self, pages: usize) -> Option<usize>;

    /// The whole region.
    fn bytes(&self) -> &[u8];

    /// The whole region, mutably.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Current size of the region in bytes.
    fn byte_len(&self) -> usize {
        self.page_count() * self.page_size()
    }
}

/// A `Vec<u8>` backed linear memory with a hard page cap.
pub struct LinearMemory {
    bytes: Vec<u8>,
    page_size: usize,
    max_pages: usize,
}

impl LinearMemory {
    /// Create a memory of `initial_pages` zeroed pages that refuses to grow
    /// beyond `max_pages`.
    ///
    /// # Panics
    /// Panics if `page_size` is not a power of two of at least one word, or if
    /// `initial_pages > max_pages`.
    pub fn new(page_size: usize, initial_pages: usize, max_pages: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= WORD_SIZE,
            "page size must be a power of two of at least one word"
        );
        assert!(initial_pages <= max_pages, "initial pages exceed the cap");
        Self {
            bytes: vec![0u8; initial_pages * page_size],
            page_size,
            max_pages,
        }
    }

    /// An empty memory with WebAssembly pages and the given cap.
    pub fn with_max_pages(max_pages: usize) -> Self {
        Self::new(WASM_PAGE_SIZE, 0, max_pages)
    }

    /// The page cap.
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }
}

impl Default for LinearMemory {
    /// WebAssembly pages, capped at the 4GB a 32-bit memory can address.
    fn default() -> Self {
        Self::with_max_pages(65536)
    }
}

impl RegionHost for LinearMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> usize {
        self.bytes.len() / self.page_size
    }

    fn grow(&mut self, pages: usize) -> Option<usize> {
        let old = self.page_count();
        let new = old.checked_add(pages)?;
        if new > self.max_pages {
            return None;
        }
        let new_len = new.checked_mul(self.page_size)?;
        self.bytes.resize(new_len, 0);
        Some(old)
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Read the word at `addr`.
#[inline]
#[track_caller]
pub fn read_word(bytes: &[u8], addr: Address) -> u64 {
    debug_assert!(addr.is_aligned(WORD_SIZE), "unaligned word read at {addr}");
    let at = addr.as_usize();
    let mut raw = [0u8; WORD_SIZE];
    raw.copy_from_slice(&bytes[at..at + WORD_SIZE]);
    u64::from_le_bytes(raw)
}

/// Write the word at `addr`.
#[inline]
#[track_caller]
pub fn write_word(bytes: &mut [u8], addr: Address, value: u64) {
    debug_assert!(addr.is_aligned(WORD_SIZE), "unaligned word write at {addr}");
    let at = addr.as_usize();
    bytes[at..at + WORD_SIZE].copy_from_slice(&value.to_le_bytes());
}

/// Shared view of the region used while a collection is running.
///
/// Collaborators receive a `MemoryView` and can only read through it. They
/// never see the [`Heap`](crate::Heap), so they cannot allocate or start a
/// collection while one is in progress. The collector writes color bits
/// through the same cells.
#[derive(Clone, Copy)]
pub struct MemoryView<'a> {
    cells: &'a [Cell<u8>],
}

impl<'a> MemoryView<'a> {
    /// View over the given bytes.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self {
            cells: Cell::from_mut(bytes).as_slice_of_cells(),
        }
    }

    /// Size of the viewed region in bytes.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True if the view covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Read the word at `addr`.
    #[inline]
    #[track_caller]
    pub fn read_word(&self, addr: Address) -> u64 {
        debug_assert!(addr.is_aligned(WORD_SIZE), "unaligned word read at {addr}");
        let at = addr.as_usize();
        let mut raw = [0u8; WORD_SIZE];
        for (dst, src) in raw.iter_mut().zip(&self.cells[at..at + WORD_SIZE]) {
            *dst = src.get();
        }
        u64::from_le_bytes(raw)
    }

    /// Read the word at `addr` as an address.
    #[inline]
    #[track_caller]
    pub fn read_address(&self, addr: Address) -> Address {
        Address::from_word(self.read_word(addr))
    }

    /// Read a single byte.
    #[inline]
    #[track_caller]
    pub fn read_byte(&self, addr: Address) -> u8 {
        self.cells[addr.as_usize()].get()
    }

    #[inline]
    #[track_caller]
    pub(crate) fn write_word(&self, addr: Address, value: u64) {
        debug_assert!(addr.is_aligned(WORD_SIZE), "unaligned word write at {addr}");
        let at = addr.as_usize();
        for (dst, src) in self.cells[at..at + WORD_SIZE]
            .iter()
            .zip(value.to_le_bytes())
        {
            dst.set(src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_memory_grow() {
        let mut mem = LinearMemory::new(4096, 1, 3);
        assert_eq!(mem.page_count(), 1);
        assert_eq!(mem.byte_len(), 4096);

        assert_eq!(mem.grow(2), Some(1));
        assert_eq!(mem.page_count(), 3);
        assert_eq!(mem.bytes().len(), 3 * 4096);

        // Cap reached
        assert_eq!(mem.grow(1), None);
        assert_eq!(mem.page_count(), 3);
    }

    #[test]
    fn test_word_round_trip() {
        let mut mem = LinearMemory::new(4096, 1, 1);
        write_word(mem.bytes_mut(), Address::new(16), 0xdead_beef_cafe_f00d);
        assert_eq!(read_word(mem.bytes(), Address::new(16)), 0xdead_beef_cafe_f00d);
        assert_eq!(mem.bytes()[16], 0x0d);
    }

    #[test]
    fn test_memory_view_shares_writes() {
        let mut mem = LinearMemory::new(4096, 1, 1);
        let view = MemoryView::new(mem.bytes_mut());
        let copy = view;
        view.write_word(Address::new(8), 42);
        assert_eq!(copy.read_word(Address::new(8)), 42);
        assert_eq!(copy.read_address(Address::new(8)), Address::new(42));
        assert_eq!(copy.read_byte(Address::new(8)), 42);
        assert_eq!(view.len(), 4096);
    }

    #[test]
    #[should_panic]
    fn test_read_out_of_bounds_panics() {
        let mem = LinearMemory::new(4096, 1, 1);
        read_word(mem.bytes(), Address::new(4096));
    }
}
