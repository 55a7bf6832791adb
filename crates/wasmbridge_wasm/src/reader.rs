//! Byte-level reader for the WASM binary format.
//!
//! All integers in the format are LEB128; every error carries the absolute
//! byte offset into the module so load failures can be located.

use crate::load::LoadError;

/// Cursor over a slice of module bytes
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Absolute offset of `data[0]` within the module
    base: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader over a whole module
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    fn with_base(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    /// Absolute offset of the next byte
    #[must_use]
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    /// True once every byte has been consumed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub(crate) fn malformed(&self, reason: impl Into<String>) -> LoadError {
        LoadError::Malformed {
            offset: self.offset(),
            reason: reason.into(),
        }
    }

    /// Read a single byte
    ///
    /// # Errors
    ///
    /// Returns `Malformed` at end of input
    pub fn read_u8(&mut self) -> Result<u8, LoadError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| self.malformed("unexpected end of input"))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Peek at the next byte without consuming it
    #[must_use]
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Read `len` raw bytes
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if fewer than `len` bytes remain
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        if len > self.remaining() {
            return Err(self.malformed(format!(
                "unexpected end of input: need {} bytes, {} left",
                len,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Split off a reader over the next `len` bytes and skip past them
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if fewer than `len` bytes remain
    pub fn split(&mut self, len: usize) -> Result<Reader<'a>, LoadError> {
        let base = self.offset();
        let bytes = self.read_bytes(len)?;
        Ok(Reader::with_base(bytes, base))
    }

    /// Read an unsigned LEB128 value of at most `bits` bits
    fn read_uleb(&mut self, bits: u32) -> Result<u64, LoadError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift + 7 >= bits {
                let used = bits - shift;
                if byte & 0x80 != 0 {
                    return Err(self.malformed("integer representation too long"));
                }
                if u32::from(byte) >> used != 0 {
                    return Err(self.malformed("integer too large"));
                }
                result |= u64::from(byte) << shift;
                return Ok(result);
            }
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a signed LEB128 value of at most `bits` bits
    fn read_sleb(&mut self, bits: u32) -> Result<i64, LoadError> {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift + 7 >= bits {
                let used = bits - shift;
                if byte & 0x80 != 0 {
                    return Err(self.malformed("integer representation too long"));
                }
                let value_mask = (1u8 << used) - 1;
                let rest = byte & 0x7F & !value_mask;
                let negative = (byte >> (used - 1)) & 1 == 1;
                let expected = if negative { 0x7F & !value_mask } else { 0 };
                if rest != expected {
                    return Err(self.malformed("integer too large"));
                }
            }
            result |= i64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Read a `u32` LEB128
    ///
    /// # Errors
    ///
    /// Returns `Malformed` on overlong or oversized encodings
    pub fn read_u32(&mut self) -> Result<u32, LoadError> {
        // 32-bit reads never exceed u32::MAX
        self.read_uleb(32).map(|v| v as u32)
    }

    /// Read an `i32` LEB128
    ///
    /// # Errors
    ///
    /// Returns `Malformed` on overlong or oversized encodings
    pub fn read_i32(&mut self) -> Result<i32, LoadError> {
        self.read_sleb(32).map(|v| v as i32)
    }

    /// Read an `i64` LEB128
    ///
    /// # Errors
    ///
    /// Returns `Malformed` on overlong or oversized encodings
    pub fn read_i64(&mut self) -> Result<i64, LoadError> {
        self.read_sleb(64)
    }

    /// Read a signed 33-bit LEB128 (block types)
    ///
    /// # Errors
    ///
    /// Returns `Malformed` on overlong or oversized encodings
    pub fn read_s33(&mut self) -> Result<i64, LoadError> {
        self.read_sleb(33)
    }

    /// Read a little-endian `f32` bit pattern
    ///
    /// # Errors
    ///
    /// Returns `Malformed` at end of input
    pub fn read_f32(&mut self) -> Result<f32, LoadError> {
        let bytes = self.read_bytes(4)?;
        Ok(f32::from_bits(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ])))
    }

    /// Read a little-endian `f64` bit pattern
    ///
    /// # Errors
    ///
    /// Returns `Malformed` at end of input
    pub fn read_f64(&mut self) -> Result<f64, LoadError> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(f64::from_bits(u64::from_le_bytes(arr)))
    }

    /// Read a length-prefixed UTF-8 name
    ///
    /// # Errors
    ///
    /// Returns `Malformed` on truncation or invalid UTF-8
    pub fn read_name(&mut self) -> Result<String, LoadError> {
        let len = self.read_u32()? as usize;
        let start = self.offset();
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| LoadError::Malformed {
                offset: start,
                reason: "malformed UTF-8 encoding".to_string(),
            })
    }

    /// Read a vector length, bounded by the bytes that remain
    ///
    /// Every vector element occupies at least one byte, so a count larger
    /// than the remaining input is malformed rather than a huge allocation.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the count cannot fit
    pub fn read_count(&mut self) -> Result<usize, LoadError> {
        let count = self.read_u32()? as usize;
        if count > self.remaining() {
            return Err(self.malformed(format!(
                "vector length {} exceeds remaining {} bytes",
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }

    /// Fail unless every byte has been consumed
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if bytes remain
    pub fn expect_end(&self, what: &str) -> Result<(), LoadError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.malformed(format!("{} size mismatch: {} trailing bytes", what, self.remaining())))
        }
    }
}
