//! Heap errors

use thiserror::Error;

use crate::address::Address;

/// Errors raised by the allocator and the collector.
///
/// Only [`HeapError::OutOfMemory`] is recoverable. The others describe a heap
/// whose invariants no longer hold; they are raised through [`fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The region could not grow enough to satisfy a request
    #[error("out of memory: cannot allocate {requested} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        requested: usize,
    },

    /// A block was freed that is not currently allocated
    #[error("double free of block at {0}")]
    DoubleFree(Address),

    /// A block header or free-list link is inconsistent
    #[error("corrupt heap at {address}: {reason}")]
    CorruptHeader {
        /// Offending block or link
        address: Address,
        /// What check failed
        reason: &'static str,
    },

    /// A collection was requested while one was already running
    #[error("collection requested while a collection is in progress")]
    ReentrantCollection,
}

impl HeapError {
    /// True for errors that leave the heap unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HeapError::OutOfMemory { .. })
    }
}

/// Result type for heap operations
pub type Result<T> = std::result::Result<T, HeapError>;

/// Report a broken heap invariant and stop.
///
/// The heap cannot be trusted after this point, and reporting the problem
/// through the mutator would need allocation. The workspace builds release
/// binaries with `panic = "abort"`.
#[cold]
#[track_caller]
pub fn fatal(error: HeapError) -> ! {
    tracing::error!(target: "linmem::gc", %error, "fatal heap error");
    panic!("{error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            HeapError::OutOfMemory { requested: 64 }.to_string(),
            "out of memory: cannot allocate 64 bytes"
        );
        assert_eq!(
            HeapError::DoubleFree(Address::new(0x20)).to_string(),
            "double free of block at 0x20"
        );
        assert_eq!(
            HeapError::CorruptHeader {
                address: Address::new(8),
                reason: "unaligned header",
            }
            .to_string(),
            "corrupt heap at 0x8: unaligned header"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(!HeapError::OutOfMemory { requested: 1 }.is_fatal());
        assert!(HeapError::ReentrantCollection.is_fatal());
        assert!(HeapError::DoubleFree(Address::NULL).is_fatal());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_fatal_panics() {
        fatal(HeapError::DoubleFree(Address::new(16)));
    }
}
