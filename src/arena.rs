//! Byte arenas used to keep handshake request and response data alive across callbacks.
//!
//! Header data handed to the orchestrator is only borrowed for the duration of the call, so it
//! has to be copied somewhere it can outlive the caller. Rather than allocating per header, all
//! bytes go into one contiguous buffer and headers are stored as [`ArenaRef`] offset/length
//! pairs. References stay valid when a growable arena reallocates, since they never point into
//! the buffer directly.

use std::ops::Range;

use crate::{request::Header, Result, WebSocketError};

/// A reference to bytes previously written into a [`ByteArena`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaRef {
    offset: usize,
    len: usize,
}

impl ArenaRef {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Capacity is reserved up front and never exceeded.
    Fixed(usize),
    /// Capacity grows on demand.
    Growable,
}

/// A contiguous, append-only byte buffer.
///
/// The default arena is growable and empty, and does not allocate.
#[derive(Debug)]
pub struct ByteArena {
    buffer: Vec<u8>,
    mode: Mode,
}

impl Default for ByteArena {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            mode: Mode::Growable,
        }
    }
}

impl ByteArena {
    /// Creates an arena that holds exactly `capacity` bytes.
    ///
    /// # Errors
    /// Returns [`WebSocketError::OutOfMemory`] if the buffer cannot be allocated.
    pub fn fixed(capacity: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(capacity)?;
        Ok(Self {
            buffer,
            mode: Mode::Fixed(capacity),
        })
    }

    /// Creates an arena that starts at `capacity` bytes and grows as needed.
    ///
    /// # Errors
    /// Returns [`WebSocketError::OutOfMemory`] if the buffer cannot be allocated.
    pub fn growable(capacity: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer.try_reserve(capacity)?;
        Ok(Self {
            buffer,
            mode: Mode::Growable,
        })
    }

    /// Appends `bytes` and returns a reference to the copy.
    ///
    /// # Errors
    /// A fixed arena fails with [`WebSocketError::OutOfSpace`] when the write doesn't fit. A
    /// growable arena fails with [`WebSocketError::OutOfMemory`] when growing fails. Nothing is
    /// written on failure.
    pub fn write(&mut self, bytes: &[u8]) -> Result<ArenaRef> {
        match self.mode {
            Mode::Fixed(_) => {
                let remaining = self.remaining();
                if bytes.len() > remaining {
                    return Err(WebSocketError::OutOfSpace {
                        requested: bytes.len(),
                        remaining,
                    });
                }
            }
            Mode::Growable => self.buffer.try_reserve(bytes.len())?,
        }

        let offset = self.buffer.len();
        self.buffer.extend_from_slice(bytes);
        Ok(ArenaRef {
            offset,
            len: bytes.len(),
        })
    }

    /// Returns the bytes behind `r`.
    ///
    /// # Panics
    /// Panics if `r` was not produced by this arena.
    #[inline]
    pub fn get(&self, r: ArenaRef) -> &[u8] {
        &self.buffer[r.range()]
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The nominal capacity of the arena. For a fixed arena this is the reserved size.
    pub fn capacity(&self) -> usize {
        match self.mode {
            Mode::Fixed(capacity) => capacity,
            Mode::Growable => self.buffer.capacity(),
        }
    }

    /// Bytes that can still be written without failing (fixed) or reallocating (growable).
    pub fn remaining(&self) -> usize {
        self.capacity() - self.buffer.len()
    }
}

/// A header whose name and value live in a [`ByteArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRef {
    pub name: ArenaRef,
    pub value: ArenaRef,
}

/// An ordered list of headers backed by a single arena.
#[derive(Debug, Default)]
pub struct HeaderStore {
    arena: ByteArena,
    records: Vec<HeaderRef>,
}

impl HeaderStore {
    /// Wraps `arena`, reserving room for `count` header records.
    pub fn with_capacity(arena: ByteArena, count: usize) -> Result<Self> {
        let mut records = Vec::new();
        records.try_reserve(count)?;
        Ok(Self { arena, records })
    }

    /// Copies `header` into the store.
    pub fn push(&mut self, header: Header<'_>) -> Result<HeaderRef> {
        self.records.try_reserve(1)?;
        let name = self.arena.write(header.name)?;
        let value = self.arena.write(header.value)?;
        let record = HeaderRef { name, value };
        self.records.push(record);
        Ok(record)
    }

    /// Copies raw bytes into the backing arena without recording a header.
    pub fn write(&mut self, bytes: &[u8]) -> Result<ArenaRef> {
        self.arena.write(bytes)
    }

    pub fn get(&self, r: ArenaRef) -> &[u8] {
        self.arena.get(r)
    }

    /// Borrowed views of every stored header, in insertion order.
    pub fn headers(&self) -> Vec<Header<'_>> {
        self.records
            .iter()
            .map(|r| Header::new(self.arena.get(r.name), self.arena.get(r.value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn arena(&self) -> &ByteArena {
        &self.arena
    }
}
