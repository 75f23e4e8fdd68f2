//! # Binary file access
//!
//! Index files mix three encodings: unsigned varints (in the protobuf
//! style), delta-encoded varints for sorted offset lists, and fixed-width
//! little-endian "file offsets" whose byte width is chosen per file to be
//! just large enough for the data section being addressed.
//!
//! [`FileWriter`] supports positioned rewrites so headers can reserve
//! space and be backpatched once payload offsets are known.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use integer_encoding::VarInt;

use crate::FileOffset;

/// Minimal number of bytes needed to store `value` in binary.
pub fn bytes_needed(value: u64) -> u8 {
    let mut value = value;
    let mut bytes = 1u8;
    while value > 0xff {
        value >>= 8;
        bytes += 1;
    }
    bytes
}

/// Encoded size of `value` as an unsigned varint.
pub fn varint_len(value: u64) -> u64 {
    value.required_space() as u64
}

/// Buffered file writer with positioned backpatching.
pub struct FileWriter {
    inner: BufWriter<File>,
    pos: FileOffset,
}

impl FileWriter {
    /// Creates (truncating) the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be created.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: BufWriter::new(file),
            pos: 0,
        })
    }

    pub const fn position(&self) -> FileOffset {
        self.pos
    }

    /// Moves the write cursor, flushing buffered bytes first.
    ///
    /// # Errors
    ///
    /// Fails if the flush or seek fails.
    pub fn set_position(&mut self, pos: FileOffset) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_mut().seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on an underlying I/O error (as do all other writes).
    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.inner.write_all(&[value])?;
        self.pos += 1;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on an underlying I/O error.
    pub fn write_u16_le(&mut self, value: u16) -> io::Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        self.pos += 2;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on an underlying I/O error.
    pub fn write_u32_le(&mut self, value: u32) -> io::Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        self.pos += 4;
        Ok(())
    }

    /// Writes an unsigned varint.
    ///
    /// # Errors
    ///
    /// Fails on an underlying I/O error.
    pub fn write_varint(&mut self, value: u64) -> io::Result<()> {
        let mut buf = [0u8; 10];
        let len = value.encode_var(&mut buf);
        self.inner.write_all(&buf[..len])?;
        self.pos += len as u64;
        Ok(())
    }

    /// Writes a signed (zigzag) varint.
    ///
    /// # Errors
    ///
    /// Fails on an underlying I/O error.
    pub fn write_varint_signed(&mut self, value: i64) -> io::Result<()> {
        let mut buf = [0u8; 10];
        let len = value.encode_var(&mut buf);
        self.inner.write_all(&buf[..len])?;
        self.pos += len as u64;
        Ok(())
    }

    /// Writes the low `bytes` bytes of `value`, little-endian.
    ///
    /// The value must fit; callers size the width with [`bytes_needed`].
    ///
    /// # Errors
    ///
    /// Fails on an underlying I/O error.
    pub fn write_offset_sized(&mut self, value: FileOffset, bytes: u8) -> io::Result<()> {
        debug_assert!(bytes >= 1 && bytes <= 8);
        debug_assert!(bytes == 8 || value < (1 << (u64::from(bytes) * 8)));
        let raw = value.to_le_bytes();
        self.inner.write_all(&raw[..usize::from(bytes)])?;
        self.pos += u64::from(bytes);
        Ok(())
    }

    /// Writes a full-width (8 byte) file offset.
    ///
    /// # Errors
    ///
    /// Fails on an underlying I/O error.
    pub fn write_offset(&mut self, value: FileOffset) -> io::Result<()> {
        self.write_offset_sized(value, 8)
    }

    /// Flushes and closes the writer.
    ///
    /// # Errors
    ///
    /// Fails if the final flush fails.
    pub fn finish(mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Whole-file reader over the formats [`FileWriter`] produces.
///
/// Index files are small relative to the object data they address, so the
/// scanner reads the entire file up front and decodes from memory.
pub struct FileScanner {
    data: Vec<u8>,
    pos: usize,
}

impl FileScanner {
    /// Reads the file at `path` into memory.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            data: std::fs::read(path)?,
            pos: 0,
        })
    }

    /// Wraps an in-memory buffer (used by tests and embedded data).
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub const fn position(&self) -> FileOffset {
        self.pos as FileOffset
    }

    /// # Errors
    ///
    /// Fails if `pos` is past the end of the file.
    pub fn set_position(&mut self, pos: FileOffset) -> io::Result<()> {
        let pos = usize::try_from(pos).map_err(|_| unexpected_eof())?;
        if pos > self.data.len() {
            return Err(unexpected_eof());
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, len: usize) -> io::Result<&[u8]> {
        let end = self.pos.checked_add(len).ok_or_else(unexpected_eof)?;
        if end > self.data.len() {
            return Err(unexpected_eof());
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// # Errors
    ///
    /// Fails at end of file (as do all other reads).
    pub fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// # Errors
    ///
    /// Fails at end of file.
    pub fn read_u16_le(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// # Errors
    ///
    /// Fails at end of file.
    pub fn read_u32_le(&mut self) -> io::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// # Errors
    ///
    /// Fails at end of file or on a malformed varint.
    pub fn read_varint(&mut self) -> io::Result<u64> {
        let (value, len) = u64::decode_var(&self.data[self.pos..])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed varint"))?;
        self.pos += len;
        Ok(value)
    }

    /// # Errors
    ///
    /// Fails at end of file or on a malformed varint.
    pub fn read_varint_signed(&mut self) -> io::Result<i64> {
        let (value, len) = i64::decode_var(&self.data[self.pos..])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed varint"))?;
        self.pos += len;
        Ok(value)
    }

    /// Reads a little-endian offset of the given byte width.
    ///
    /// # Errors
    ///
    /// Fails at end of file.
    pub fn read_offset_sized(&mut self, bytes: u8) -> io::Result<FileOffset> {
        let slice = self.take(usize::from(bytes))?;
        let mut raw = [0u8; 8];
        raw[..slice.len()].copy_from_slice(slice);
        Ok(u64::from_le_bytes(raw))
    }

    /// # Errors
    ///
    /// Fails at end of file.
    pub fn read_offset(&mut self) -> io::Result<FileOffset> {
        self.read_offset_sized(8)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file")
}
