//! Bounds-checked cursors over byte buffers.
//!
//! All multi-byte integers on the report wire are big-endian. Strings
//! are carried as a one-byte length followed by that many raw bytes.

use thiserror::Error;

/// Longest string a one-byte length prefix can describe.
pub const MAX_PREFIXED_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("string of {0} bytes does not fit a one-byte length prefix")]
    StringTooLong(usize),
    #[error("record length {0} does not fit a 16-bit length field")]
    RecordTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid tag 0x{0:04x}")]
    InvalidTag(u16),
    #[error("invalid length {0}")]
    InvalidLength(usize),
}

#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn as_written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), EncodeError> {
        if self.remaining() < 1 {
            return Err(EncodeError::BufferTooSmall);
        }
        self.buf[self.pos] = value;
        self.pos += 1;
        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        if self.remaining() < data.len() {
            return Err(EncodeError::BufferTooSmall);
        }
        let end = self.pos + data.len();
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    pub fn write_be_u16(&mut self, value: u16) -> Result<(), EncodeError> {
        self.write_all(&value.to_be_bytes())
    }

    pub fn write_be_u32(&mut self, value: u32) -> Result<(), EncodeError> {
        self.write_all(&value.to_be_bytes())
    }

    /// Writes `data` preceded by its one-byte length.
    pub fn write_length_prefixed(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let len = u8::try_from(data.len()).map_err(|_| EncodeError::StringTooLong(data.len()))?;
        if self.remaining() < 1 + data.len() {
            return Err(EncodeError::BufferTooSmall);
        }
        self.write_u8(len)?;
        self.write_all(data)
    }

    /// Reserves a big-endian u16 to be filled in later by [`Self::patch_be_u16`].
    pub fn reserve_be_u16(&mut self) -> Result<usize, EncodeError> {
        let at = self.pos;
        self.write_be_u16(0)?;
        Ok(at)
    }

    pub fn patch_be_u16(&mut self, at: usize, value: u16) -> Result<(), EncodeError> {
        if at + 2 > self.pos {
            return Err(EncodeError::BufferTooSmall);
        }
        self.buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Zero-pads until `position() - start` is a multiple of four.
    pub fn pad_to_word(&mut self, start: usize) -> Result<(), EncodeError> {
        while (self.pos - start) % 4 != 0 {
            self.write_u8(0)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub const fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..start + len])
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_exact(N)?);
        Ok(out)
    }

    pub fn read_be_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_be_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_le_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Reads a one-byte length and then that many bytes. The declared
    /// length is checked against what is actually left in the buffer.
    pub fn read_length_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u8()? as usize;
        self.read_exact(len)
    }
}
