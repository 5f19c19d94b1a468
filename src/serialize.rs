//! Fixed-width big-endian read/write primitives over bounded buffers.
//!
//! Every write and read checks the remaining length first and fails with
//! [`SerializeError::BufferTooShort`] instead of panicking, so encoders and
//! decoders that feed cache values can propagate truncation with `?`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    #[error("buffer too short: need {need} bytes, {left} left")]
    BufferTooShort { need: usize, left: usize },

    #[error("length {len} does not fit in a {width}-byte prefix")]
    LengthOverflow { len: usize, width: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

/// Bounded big-endian writer over a mutable byte slice.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes still available for writing.
    pub fn left(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, need: usize) -> Result<&mut [u8], SerializeError> {
        let left = self.left();
        if left < need {
            return Err(SerializeError::BufferTooShort { need, left });
        }
        let start = self.pos;
        self.pos += need;
        Ok(&mut self.buf[start..start + need])
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), SerializeError> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), SerializeError> {
        self.reserve(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), SerializeError> {
        self.reserve(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), SerializeError> {
        self.reserve(8)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<(), SerializeError> {
        self.reserve(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Writes a one-byte length followed by `data`.
    pub fn write_u8_data(&mut self, data: &[u8]) -> Result<(), SerializeError> {
        let len = u8::try_from(data.len()).map_err(|_| SerializeError::LengthOverflow {
            len: data.len(),
            width: 1,
        })?;
        // Check the whole section up front so a failed write leaves no prefix behind.
        let need = 1 + data.len();
        if self.left() < need {
            return Err(SerializeError::BufferTooShort {
                need,
                left: self.left(),
            });
        }
        self.write_u8(len)?;
        self.write_data(data)
    }

    /// Writes a two-byte length followed by the string bytes.
    pub fn write_u16_string(&mut self, s: &str) -> Result<(), SerializeError> {
        let len = u16::try_from(s.len()).map_err(|_| SerializeError::LengthOverflow {
            len: s.len(),
            width: 2,
        })?;
        let need = 2 + s.len();
        if self.left() < need {
            return Err(SerializeError::BufferTooShort {
                need,
                left: self.left(),
            });
        }
        self.write_u16(len)?;
        self.write_data(s.as_bytes())
    }
}

/// Bounded big-endian reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn left(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.left() == 0
    }

    fn take(&mut self, need: usize) -> Result<&'a [u8], SerializeError> {
        let left = self.left();
        if left < need {
            return Err(SerializeError::BufferTooShort { need, left });
        }
        let start = self.pos;
        self.pos += need;
        Ok(&self.buf[start..start + need])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], SerializeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, SerializeError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, SerializeError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, SerializeError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// Reads a one-byte length and that many bytes. The cursor does not move on failure.
    pub fn read_u8_data(&mut self) -> Result<&'a [u8], SerializeError> {
        let mut ahead = self.clone();
        let len = ahead.read_u8()? as usize;
        let data = ahead.take(len)?;
        *self = ahead;
        Ok(data)
    }

    /// Reads a two-byte length and that many bytes as UTF-8.
    pub fn read_u16_string(&mut self) -> Result<&'a str, SerializeError> {
        let mut ahead = self.clone();
        let len = ahead.read_u16()? as usize;
        let data = ahead.take(len)?;
        let s = std::str::from_utf8(data).map_err(|_| SerializeError::InvalidUtf8)?;
        *self = ahead;
        Ok(s)
    }
}
