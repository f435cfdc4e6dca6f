//! Fixed capacity byte buffer

use alloc::{boxed::Box, vec};
use core::fmt;

use crate::error::TransportError;

/// Byte buffer allocated once that never grows
pub struct FixedBuffer {
    storage: Box<[u8]>,
    len: usize,
}

impl FixedBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Total number of bytes the buffer can hold
    pub const fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes held
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop the contents, zeroing the bytes that were in use
    pub fn clear(&mut self) {
        self.storage[..self.len].fill(0);
        self.len = 0;
    }

    /// Append `data`, failing without modification if it does not fit
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let tail = self.reserve_tail(data.len())?;
        tail.copy_from_slice(data);
        Ok(())
    }

    /// Claim `n` bytes past the current end and return them for writing
    pub fn reserve_tail(&mut self, n: usize) -> Result<&mut [u8], TransportError> {
        let start = self.len;
        let end = start
            .checked_add(n)
            .filter(|end| *end <= self.capacity())
            .ok_or(TransportError::BufferOverflow {
                capacity: self.capacity(),
                needed: start.saturating_add(n),
            })?;
        self.len = end;
        Ok(&mut self.storage[start..end])
    }

    /// Replace the contents with the bytes written by `fill`
    ///
    /// `fill` receives the whole storage and returns how many bytes it used.
    pub fn fill_with<E>(
        &mut self,
        fill: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<(), E> {
        self.clear();
        let len = fill(&mut self.storage)?;
        self.len = len.min(self.capacity());
        Ok(())
    }

    /// The bytes held
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }
}

impl fmt::Debug for FixedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
