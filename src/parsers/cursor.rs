//! A fully buffered byte source with a movable read cursor.
//!
//! The whole file is materialized into memory up front; after that, every
//! decode is pure cursor arithmetic with no blocking I/O. Multi-byte reads
//! honor the endianness and pointer width recorded in the file header, which
//! is parsed once during construction and fixed for the cursor's lifetime.
//!
//! If the buffered bytes do not start with a valid header, they are treated
//! as a gzip stream, decompressed in full and the header parse is retried
//! once. A second failure aborts construction.

use super::{
    blend::{self, Header, HEADER_LEN},
    finish,
    primitive::*,
    BlendError, Endianness, PointerSize, Result,
};
use libflate::gzip;
use std::io::Read;

pub struct ByteCursor {
    data: Vec<u8>,
    position: usize,
    header: Header,
}

impl ByteCursor {
    /// Buffers the entire source and parses the file header, falling back to
    /// gzip decompression when the raw bytes are not a valid header. The
    /// cursor is left positioned at the first block.
    pub fn new<R: Read>(mut source: R) -> Result<ByteCursor> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;

        let header = match finish(blend::header(&data)) {
            Ok(header) => header,
            Err(_) => {
                let mut decoder = gzip::Decoder::new(&data[..])
                    .map_err(|e| BlendError::Decompression(e.to_string()))?;
                let mut inflated = Vec::new();
                decoder
                    .read_to_end(&mut inflated)
                    .map_err(|e| BlendError::Decompression(e.to_string()))?;
                data = inflated;
                finish(blend::header(&data))?
            }
        };

        Ok(ByteCursor {
            data,
            position: HEADER_LEN,
            header,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn endianness(&self) -> Endianness {
        self.header.endianness
    }

    pub fn pointer_size(&self) -> PointerSize {
        self.header.pointer_size
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Absolute repositioning. Positioning at the very end is allowed;
    /// positioning past it is not.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.data.len() {
            return Err(BlendError::NotEnoughData);
        }
        self.position = position;
        Ok(())
    }

    /// Advances the cursor to the next multiple of `alignment` if it is not
    /// already on one.
    pub fn align_position(&mut self, alignment: usize) -> Result<()> {
        if alignment == 0 {
            return Err(BlendError::InvalidState(
                "alignment must be positive".to_owned(),
            ));
        }
        let remainder = self.position % alignment;
        if remainder != 0 {
            self.set_position(self.position + alignment - remainder)?;
        }
        Ok(())
    }

    /// Reads `len` bytes, advancing the cursor past them.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BlendError::NotEnoughData)?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let endianness = self.endianness();
        Ok(parse_u8(self.read_bytes(1)?, endianness))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        let endianness = self.endianness();
        Ok(parse_i8(self.read_bytes(1)?, endianness))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let endianness = self.endianness();
        Ok(parse_i16(self.read_bytes(2)?, endianness))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let endianness = self.endianness();
        Ok(parse_u16(self.read_bytes(2)?, endianness))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let endianness = self.endianness();
        Ok(parse_i32(self.read_bytes(4)?, endianness))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let endianness = self.endianness();
        Ok(parse_u32(self.read_bytes(4)?, endianness))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let endianness = self.endianness();
        Ok(parse_i64(self.read_bytes(8)?, endianness))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let endianness = self.endianness();
        Ok(parse_u64(self.read_bytes(8)?, endianness))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let endianness = self.endianness();
        Ok(parse_f32(self.read_bytes(4)?, endianness))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let endianness = self.endianness();
        Ok(parse_f64(self.read_bytes(8)?, endianness))
    }

    /// Reads 4 or 8 bytes depending on the header-declared pointer size,
    /// widening to `u64`.
    pub fn read_pointer(&mut self) -> Result<u64> {
        match self.pointer_size() {
            PointerSize::Bits32 => Ok(u64::from(self.read_u32()?)),
            PointerSize::Bits64 => self.read_u64(),
        }
    }

    /// Reads bytes up to (and consuming) a NUL terminator; the terminator is
    /// not part of the returned string.
    pub fn read_string(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let byte = self.read_u8()?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
