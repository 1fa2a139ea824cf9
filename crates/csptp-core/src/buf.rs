//! Octet buffer with a data-length cursor.
//!
//! Sockets receive into the full capacity and record how much arrived; the
//! codec builds messages in place and trims the cursor to the frame size.
//! Growing is allowed, shrinking is refused.

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    len: usize,
}

impl Buffer {
    /// Allocate a zeroed buffer. Zero-size buffers are refused.
    pub fn alloc(size: usize) -> Result<Self> {
        if size == 0 {
            tracing::warn!("buffer size is zero");
            return Err(Error::Contract("buffer size is zero"));
        }
        Ok(Self { data: vec![0u8; size], len: 0 })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the data-length cursor; refused beyond the buffer size.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.data.len() {
            tracing::warn!(len, size = self.data.len(), "length exceeds buffer size");
            return Err(Error::Contract("length exceeds buffer size"));
        }
        self.len = len;
        Ok(())
    }

    /// Grow to `new_size`, preserving contents. Equal size is a no-op,
    /// shrinking is refused.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        if new_size < self.data.len() {
            tracing::warn!(new_size, size = self.data.len(), "buffer shrink ignored");
            return Err(Error::Contract("buffer will not shrink"));
        }
        if new_size > self.data.len() {
            self.data.resize(new_size, 0);
        }
        Ok(())
    }

    /// Same-size, same-content copy with the same data length.
    pub fn spawn(&self) -> Self {
        Self { data: self.data.clone(), len: self.len }
    }

    /// Whole capacity, mutable (receive target).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whole capacity.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The valid data prefix.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rejects_zero() {
        assert!(Buffer::alloc(0).is_err());
        let b = Buffer::alloc(16).unwrap();
        assert_eq!(b.size(), 16);
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn set_len_bounds() {
        let mut b = Buffer::alloc(8).unwrap();
        b.set_len(8).unwrap();
        assert_eq!(b.len(), 8);
        assert!(b.set_len(9).is_err());
        assert_eq!(b.len(), 8);
    }

    #[test]
    fn resize_grow_only() {
        let mut b = Buffer::alloc(4).unwrap();
        b.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        b.set_len(4).unwrap();

        assert!(b.resize(2).is_err());
        b.resize(4).unwrap(); // no-op
        b.resize(8).unwrap();
        assert_eq!(b.size(), 8);
        assert_eq!(b.len(), 4);
        assert_eq!(b.data(), &[1, 2, 3, 4]);
        assert_eq!(&b.as_slice()[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn spawn_copies_everything() {
        let mut b = Buffer::alloc(6).unwrap();
        b.as_mut_slice()[..3].copy_from_slice(&[9, 8, 7]);
        b.set_len(3).unwrap();

        let c = b.spawn();
        assert_eq!(c.size(), b.size());
        assert_eq!(c.len(), b.len());
        assert_eq!(c.as_slice(), b.as_slice());
    }
}
