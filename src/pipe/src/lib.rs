// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A contiguous byte buffer with distinct producer and consumer cursors, used
//! as the read and write staging area for a connection. The producer writes
//! into the unused tail of the buffer and commits bytes with `produced()`, the
//! consumer reads from the head and releases bytes with `consumed()`. When the
//! cursors meet the pipe is empty and both cursors snap back to the origin.

#[macro_use]
extern crate log;

use std::io::{Error, ErrorKind};
use thiserror::Error as ThisError;

const KB: usize = 1024;

/// Default capacity for newly created pipes. Oversized pipes shrink back down
/// to this size between commands.
pub const DEFAULT_PIPE_SIZE: usize = 2 * KB;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum PipeError {
    /// The caller tried to produce or consume more bytes than the pipe holds.
    /// This indicates a framing bug and is fatal for the connection.
    #[error("produce or consume length exceeds the available region")]
    InvalidLength,
}

/// A byte pipe: `[0, read_head)` is already-consumed space, `[read_head,
/// write_head)` is readable data, and `[write_head, capacity)` is writable
/// space.
pub struct Pipe {
    buffer: Vec<u8>,
    read_head: usize,
    write_head: usize,
    target_size: usize,
}

impl Pipe {
    pub fn new(target_size: usize) -> Self {
        Self {
            buffer: vec![0; target_size],
            read_head: 0,
            write_head: 0,
            target_size,
        }
    }

    /// Current total capacity, which may exceed the target size after a large
    /// packet forced the pipe to grow.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of readable bytes.
    pub fn rsize(&self) -> usize {
        self.write_head - self.read_head
    }

    /// Number of writable bytes remaining before the pipe must grow.
    pub fn wsize(&self) -> usize {
        self.buffer.len() - self.write_head
    }

    pub fn empty(&self) -> bool {
        self.read_head == self.write_head
    }

    pub fn full(&self) -> bool {
        self.wsize() == 0
    }

    /// The readable region.
    pub fn rdata(&self) -> &[u8] {
        &self.buffer[self.read_head..self.write_head]
    }

    /// The writable region. Callers write here and then commit with
    /// `produced()`.
    pub fn wdata(&mut self) -> &mut [u8] {
        &mut self.buffer[self.write_head..]
    }

    /// Commit `amt` bytes previously written into `wdata()`.
    pub fn produced(&mut self, amt: usize) -> Result<(), PipeError> {
        if amt > self.wsize() {
            return Err(PipeError::InvalidLength);
        }
        self.write_head += amt;
        Ok(())
    }

    /// Release `amt` bytes from the readable region. When everything has been
    /// consumed, both cursors return to the origin so the full capacity is
    /// writable again.
    pub fn consumed(&mut self, amt: usize) -> Result<(), PipeError> {
        if amt > self.rsize() {
            return Err(PipeError::InvalidLength);
        }
        self.read_head += amt;
        if self.read_head == self.write_head {
            self.read_head = 0;
            self.write_head = 0;
        }
        Ok(())
    }

    /// Produce bytes by handing the writable region to a callback, typically a
    /// socket read. The callback returns the number of bytes it filled in.
    pub fn produce<F>(&mut self, f: F) -> std::io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<usize>,
    {
        let amt = f(self.wdata())?;
        self.produced(amt)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
        Ok(amt)
    }

    /// Consume bytes by handing the readable region to a callback which
    /// returns how many bytes it accepted.
    pub fn consume<F>(&mut self, f: F) -> Result<usize, PipeError>
    where
        F: FnOnce(&[u8]) -> usize,
    {
        let amt = f(self.rdata());
        self.consumed(amt)?;
        Ok(amt)
    }

    /// Make room for at least `amt` more writable bytes, first by compacting
    /// unread data to the origin and then by growing the buffer in multiples
    /// of the target size.
    pub fn ensure_capacity(&mut self, amt: usize) {
        if amt <= self.wsize() {
            return;
        }

        self.compact();

        if amt > self.wsize() {
            let shortfall = amt - self.wsize();
            let grow = ((shortfall / self.target_size) + 1) * self.target_size;
            trace!("growing pipe by {} bytes", grow);
            self.buffer.resize(self.buffer.len() + grow, 0);
        }
    }

    /// Drop all content and reset the cursors.
    pub fn clear(&mut self) {
        self.read_head = 0;
        self.write_head = 0;
    }

    /// Move unread bytes to the origin of the buffer, reclaiming the consumed
    /// prefix for future writes.
    pub fn compact(&mut self) {
        if self.read_head == 0 {
            return;
        }
        if self.empty() {
            self.clear();
            return;
        }
        self.buffer.copy_within(self.read_head..self.write_head, 0);
        self.write_head -= self.read_head;
        self.read_head = 0;
    }

    /// Return an oversized pipe to its target size. Only possible when the
    /// pipe holds no data.
    pub fn shrink(&mut self) {
        if self.empty() && self.buffer.len() > self.target_size {
            trace!("shrinking pipe to {} bytes", self.target_size);
            self.buffer = vec![0; self.target_size];
            self.clear();
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("capacity", &self.capacity())
            .field("read_head", &self.read_head)
            .field("write_head", &self.write_head)
            .finish()
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new(DEFAULT_PIPE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new() {
        let pipe = Pipe::new(64);
        assert_eq!(pipe.capacity(), 64);
        assert_eq!(pipe.rsize(), 0);
        assert_eq!(pipe.wsize(), 64);
        assert!(pipe.empty());
        assert!(!pipe.full());
    }

    #[test]
    // write into wdata, commit, and read back through rdata
    fn produce_and_consume() {
        let mut pipe = Pipe::new(16);

        pipe.wdata()[0..5].copy_from_slice(b"hello");
        pipe.produced(5).unwrap();
        assert_eq!(pipe.rsize(), 5);
        assert_eq!(pipe.wsize(), 11);
        assert_eq!(pipe.rdata(), b"hello");

        pipe.consumed(2).unwrap();
        assert_eq!(pipe.rdata(), b"llo");

        // consuming the rest snaps the cursors back to the origin
        pipe.consumed(3).unwrap();
        assert!(pipe.empty());
        assert_eq!(pipe.wsize(), 16);
    }

    #[test]
    fn produce_too_much() {
        let mut pipe = Pipe::new(8);
        assert_eq!(pipe.produced(9), Err(PipeError::InvalidLength));
    }

    #[test]
    fn consume_too_much() {
        let mut pipe = Pipe::new(8);
        pipe.produced(4).unwrap();
        assert_eq!(pipe.consumed(5), Err(PipeError::InvalidLength));
        // the failed consume must not move the cursor
        assert_eq!(pipe.rsize(), 4);
    }

    #[test]
    fn closure_forms() {
        let mut pipe = Pipe::new(16);

        let n = pipe
            .produce(|buf| {
                buf[0..4].copy_from_slice(b"abcd");
                Ok(4)
            })
            .unwrap();
        assert_eq!(n, 4);

        let n = pipe
            .consume(|data| {
                assert_eq!(data, b"abcd");
                2
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(pipe.rdata(), b"cd");
    }

    #[test]
    // a partial consume followed by ensure_capacity compacts the pipe so the
    // consumed prefix becomes writable again
    fn compaction() {
        let mut pipe = Pipe::new(8);
        pipe.wdata()[0..8].copy_from_slice(b"abcdefgh");
        pipe.produced(8).unwrap();
        pipe.consumed(6).unwrap();
        assert!(pipe.full());

        pipe.ensure_capacity(4);
        assert_eq!(pipe.rdata(), b"gh");
        assert!(pipe.wsize() >= 4);
        assert_eq!(pipe.capacity(), 8);
    }

    #[test]
    // growth happens in multiples of the target size and shrink returns to it
    fn grow_and_shrink() {
        let mut pipe = Pipe::new(8);
        pipe.ensure_capacity(20);
        assert!(pipe.wsize() >= 20);
        assert_eq!(pipe.capacity() % 8, 0);

        // shrink is a no-op while data remains
        pipe.wdata()[0] = b'x';
        pipe.produced(1).unwrap();
        pipe.shrink();
        assert!(pipe.capacity() > 8);

        pipe.consumed(1).unwrap();
        pipe.shrink();
        assert_eq!(pipe.capacity(), 8);
    }

    #[test]
    fn ensure_capacity_preserves_content() {
        let mut pipe = Pipe::new(4);
        pipe.wdata()[0..3].copy_from_slice(b"xyz");
        pipe.produced(3).unwrap();
        pipe.ensure_capacity(64);
        assert_eq!(pipe.rdata(), b"xyz");
        assert!(pipe.wsize() >= 64);
    }
}
