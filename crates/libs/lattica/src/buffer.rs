use core::cmp::min;
use core::fmt;

use crate::error::LatticaError;

/// Fixed-capacity byte buffer used on packet hot paths. Payload-sized
/// instances live on the stack and copy cheaply.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct FixedBuf<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        Self { bytes: [0u8; N], len: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.push_truncated(data);
        buf
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn truncate(&mut self, len: usize) {
        self.len = min(len, N);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends as much of `data` as fits; returns the number of bytes taken.
    pub fn push_truncated(&mut self, data: &[u8]) -> usize {
        let take = min(data.len(), N - self.len);
        self.push(&data[..take]).unwrap_or(0)
    }

    pub fn push(&mut self, data: &[u8]) -> Result<usize, LatticaError> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.len + data.len() > N {
            return Err(LatticaError::OutOfMemory);
        }
        self.bytes[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(data.len())
    }

    pub fn append(&mut self, data: &[u8]) -> Result<&mut Self, LatticaError> {
        self.push(data)?;
        Ok(self)
    }

    pub fn append_truncated(&mut self, data: &[u8]) -> &mut Self {
        self.push_truncated(data);
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    /// Exposes `len` writable bytes, extending the logical length. Intended
    /// for in-place cipher output followed by [`FixedBuf::truncate`].
    pub fn grow_to(&mut self, len: usize) -> &mut [u8] {
        self.len = min(len, N);
        &mut self.bytes[..self.len]
    }

    pub fn grow_max(&mut self) -> &mut [u8] {
        self.grow_to(N)
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Display for FixedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x")?;
        for i in 0..self.len {
            write!(f, "{:02x}", self.bytes[i])?;
        }
        write!(f, "]")
    }
}

/// Bounded forward-only writer over a borrowed slice.
pub struct ByteWriter<'a> {
    target: &'a mut [u8],
    written: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(target: &'a mut [u8]) -> Self {
        Self { target, written: 0 }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, LatticaError> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.written + data.len() > self.target.len() {
            return Err(LatticaError::OutOfMemory);
        }
        self.target[self.written..self.written + data.len()].copy_from_slice(data);
        self.written += data.len();
        Ok(data.len())
    }

    pub fn write_u8(&mut self, byte: u8) -> Result<usize, LatticaError> {
        self.write(&[byte])
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.target[..self.written]
    }
}

/// Bounded forward-only reader over a borrowed slice.
pub struct ByteReader<'a> {
    source: &'a [u8],
    consumed: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Self { source, consumed: 0 }
    }

    pub fn read_into(&mut self, out: &mut [u8]) -> Result<usize, LatticaError> {
        if self.consumed + out.len() > self.source.len() {
            return Err(LatticaError::OutOfMemory);
        }
        out.copy_from_slice(&self.source[self.consumed..self.consumed + out.len()]);
        self.consumed += out.len();
        Ok(out.len())
    }

    pub fn read_u8(&mut self) -> Result<u8, LatticaError> {
        let mut byte = [0u8; 1];
        self.read_into(&mut byte)?;
        Ok(byte[0])
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], LatticaError> {
        if self.consumed + len > self.source.len() {
            return Err(LatticaError::OutOfMemory);
        }
        let slice = &self.source[self.consumed..self.consumed + len];
        self.consumed += len;
        Ok(slice)
    }

    pub fn remaining(&self) -> usize {
        self.source.len() - self.consumed
    }
}
