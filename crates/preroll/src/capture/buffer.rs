//! Circular byte store for the live encoded stream
//!
//! Only the most recent `capacity` bytes are retrievable; older bytes are
//! overwritten silently. Offsets handed out by this type are physical
//! positions in `[0, capacity)`.

use std::io::{self, Write};

use crate::error::{CaptureError, Result};

pub struct RingBuffer {
    data: Box<[u8]>,
    /// Next physical write position
    write_pos: usize,
    /// Set once the write cursor has reached the end at least once
    wrapped: bool,
}

impl RingBuffer {
    /// Allocation failure is reported instead of aborting the process.
    pub fn new(capacity: usize) -> Result<Self> {
        assert!(capacity > 0, "RingBuffer capacity must be non-zero");
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| CaptureError::BufferAllocation { capacity })?;
        data.resize(capacity, 0);
        Ok(Self {
            data: data.into_boxed_slice(),
            write_pos: 0,
            wrapped: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Number of retrievable bytes.
    pub fn len(&self) -> usize {
        if self.wrapped {
            self.capacity()
        } else {
            self.write_pos
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes at the write cursor, splitting the copy at the physical end.
    pub fn append(&mut self, bytes: &[u8]) {
        let cap = self.capacity();
        let len = bytes.len();
        if len == 0 {
            return;
        }

        if len >= cap {
            // Only the trailing `cap` bytes survive; lay them out so the
            // oldest one sits at the new write cursor.
            let tail = &bytes[len - cap..];
            let new_pos = (self.write_pos + len) % cap;
            let first = cap - new_pos;
            self.data[new_pos..].copy_from_slice(&tail[..first]);
            self.data[..new_pos].copy_from_slice(&tail[first..]);
            self.write_pos = new_pos;
            self.wrapped = true;
            return;
        }

        let to_end = (cap - self.write_pos).min(len);
        let to_start = len - to_end;
        self.data[self.write_pos..self.write_pos + to_end].copy_from_slice(&bytes[..to_end]);
        self.data[..to_start].copy_from_slice(&bytes[to_end..]);

        if self.write_pos + len >= cap {
            self.wrapped = true;
        }
        self.write_pos = (self.write_pos + len) % cap;
    }

    /// True if writing `len` bytes at the cursor would overwrite the byte at `offset`.
    pub fn will_overwrite(&self, offset: usize, len: usize) -> bool {
        let cap = self.capacity();
        if len >= cap {
            return true;
        }
        (offset + cap - self.write_pos) % cap < len
    }

    /// Bytes between `offset` and the write cursor in stream order, or None
    /// if `offset` does not point into retained data.
    pub fn distance_to_cursor(&self, offset: usize) -> Option<usize> {
        if offset >= self.capacity() {
            return None;
        }
        if offset < self.write_pos {
            Some(self.write_pos - offset)
        } else if self.wrapped {
            Some(self.capacity() - offset + self.write_pos)
        } else if offset == self.write_pos {
            Some(0)
        } else {
            None
        }
    }

    /// Logically ordered bytes from `from` up to the write cursor.
    ///
    /// When the traversal crosses the physical end the region is returned as
    /// two contiguous slices. On a wrapped buffer `from == write_pos` means
    /// the whole buffer.
    pub fn materialize(&self, from: usize) -> Result<Region<'_>> {
        if self.distance_to_cursor(from).is_none() {
            return Err(CaptureError::Invariant(format!(
                "materialize offset {} outside retained data (cursor {}, wrapped {})",
                from, self.write_pos, self.wrapped
            )));
        }

        if from < self.write_pos || !self.wrapped {
            Ok(Region {
                first: &self.data[from..self.write_pos],
                second: &[],
            })
        } else {
            Ok(Region {
                first: &self.data[from..],
                second: &self.data[..self.write_pos],
            })
        }
    }

    /// Byte at a physical offset.
    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    /// Forget all contents. The allocation is kept.
    pub fn reset(&mut self) {
        self.write_pos = 0;
        self.wrapped = false;
    }
}

/// A logically contiguous byte range that may span the physical end of the ring.
#[derive(Debug, Clone, Copy)]
pub struct Region<'a> {
    first: &'a [u8],
    second: &'a [u8],
}

impl<'a> Region<'a> {
    pub const EMPTY: Region<'static> = Region {
        first: &[],
        second: &[],
    };

    pub fn as_slices(&self) -> (&'a [u8], &'a [u8]) {
        (self.first, self.second)
    }

    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.first);
        out.extend_from_slice(self.second);
        out
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.first)?;
        out.write_all(self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(start: usize, len: usize) -> Vec<u8> {
        (start..start + len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn materialize_reproduces_appends_below_capacity() {
        let mut ring = RingBuffer::new(64).unwrap();
        let mut expected = Vec::new();
        for (i, len) in [5usize, 17, 1, 30, 11].iter().enumerate() {
            let chunk = pattern(i * 100, *len);
            ring.append(&chunk);
            expected.extend_from_slice(&chunk);
        }
        assert_eq!(expected.len(), 64);
        // Exactly full: cursor back at 0 and wrapped
        assert!(ring.is_wrapped());
        assert_eq!(ring.materialize(0).unwrap().to_vec(), expected);
    }

    #[test]
    fn materialize_partial_fill() {
        let mut ring = RingBuffer::new(100).unwrap();
        ring.append(b"hello ");
        ring.append(b"world");
        assert!(!ring.is_wrapped());
        assert_eq!(ring.len(), 11);
        assert_eq!(ring.materialize(0).unwrap().to_vec(), b"hello world");
        assert_eq!(ring.materialize(6).unwrap().to_vec(), b"world");
        assert!(ring.materialize(11).unwrap().is_empty());
    }

    #[test]
    fn append_splits_across_physical_end() {
        let mut ring = RingBuffer::new(8).unwrap();
        ring.append(b"abcdef");
        ring.append(b"ghij");
        assert!(ring.is_wrapped());
        assert_eq!(ring.write_pos(), 2);

        let region = ring.materialize(ring.write_pos()).unwrap();
        let (first, second) = region.as_slices();
        assert_eq!(first, b"cdef");
        assert_eq!(second, b"ghij");
        assert_eq!(region.to_vec(), b"cdefghij");
    }

    #[test]
    fn overfill_keeps_most_recent_capacity_bytes() {
        let cap = 16;
        let mut ring = RingBuffer::new(cap).unwrap();
        let all = pattern(0, cap + 5);
        for piece in all.chunks(3) {
            ring.append(piece);
        }
        let region = ring.materialize(ring.write_pos()).unwrap();
        assert_eq!(region.to_vec(), all[all.len() - cap..].to_vec());
    }

    #[test]
    fn single_append_larger_than_capacity() {
        let mut ring = RingBuffer::new(10).unwrap();
        ring.append(b"xyz");
        let big = pattern(0, 27);
        ring.append(&big);
        assert!(ring.is_wrapped());
        assert_eq!(ring.write_pos(), 0);
        assert_eq!(
            ring.materialize(ring.write_pos()).unwrap().to_vec(),
            big[17..].to_vec()
        );
    }

    #[test]
    fn will_overwrite_accounts_for_wrap() {
        let mut ring = RingBuffer::new(10).unwrap();
        ring.append(&[0u8; 8]);
        // Cursor at 8: a 4-byte write covers 8, 9, 0, 1
        assert!(ring.will_overwrite(8, 4));
        assert!(ring.will_overwrite(1, 4));
        assert!(!ring.will_overwrite(2, 4));
        assert!(!ring.will_overwrite(7, 4));
        assert!(ring.will_overwrite(5, 10));
    }

    #[test]
    fn distance_to_cursor() {
        let mut ring = RingBuffer::new(10).unwrap();
        ring.append(&[1u8; 6]);
        assert_eq!(ring.distance_to_cursor(2), Some(4));
        assert_eq!(ring.distance_to_cursor(8), None);
        ring.append(&[2u8; 6]);
        // Cursor at 2, wrapped
        assert_eq!(ring.distance_to_cursor(8), Some(4));
        assert_eq!(ring.distance_to_cursor(2), Some(10));
        assert_eq!(ring.distance_to_cursor(10), None);
    }

    #[test]
    fn materialize_rejects_unwritten_offset() {
        let mut ring = RingBuffer::new(10).unwrap();
        ring.append(b"abc");
        let err = ring.materialize(5).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn impossible_capacity_is_an_error() {
        let err = RingBuffer::new(usize::MAX).err().unwrap();
        assert!(matches!(err, CaptureError::BufferAllocation { capacity: usize::MAX }));
        assert!(err.is_configuration_fault());
    }

    #[test]
    fn reset_forgets_contents() {
        let mut ring = RingBuffer::new(4).unwrap();
        ring.append(b"abcdef");
        ring.reset();
        assert!(ring.is_empty());
        assert!(!ring.is_wrapped());
        ring.append(b"z");
        assert_eq!(ring.materialize(0).unwrap().to_vec(), b"z");
    }

    #[test]
    fn region_write_to() {
        let mut ring = RingBuffer::new(4).unwrap();
        ring.append(b"abcdef");
        let mut out = Vec::new();
        ring.materialize(ring.write_pos())
            .unwrap()
            .write_to(&mut out)
            .unwrap();
        assert_eq!(out, b"cdef");
    }
}
