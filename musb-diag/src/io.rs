//! Access to the controller register block.
//!
//! The diagnostics never touch hardware directly. Everything goes through
//! [`RegisterIo`], which is implemented here for an in-memory block
//! ([`RegisterFile`]), for a register snapshot image read through file I/O
//! ([`MappedRegisters`]), and on Unix for the live controller mapped from
//! `/dev/mem` ([`MmioRegisters`]).

use std::io::{Read, Seek, SeekFrom, Write};

#[cfg(unix)]
mod mmio;

#[cfg(unix)]
pub use mmio::MmioRegisters;

use crate::Error;
use crate::registers::BLOCK_SIZE;

/// Byte-offset register reads and writes of 8, 16 and 32 bits.
///
/// Multi-byte registers are little-endian, as on every platform the MUSB core
/// ships on.
pub trait RegisterIo {
    /// Read an 8-bit register.
    fn read8(&mut self, offset: usize) -> Result<u8, Error>;
    /// Read a 16-bit register.
    fn read16(&mut self, offset: usize) -> Result<u16, Error>;
    /// Read a 32-bit register.
    fn read32(&mut self, offset: usize) -> Result<u32, Error>;
    /// Write an 8-bit register.
    fn write8(&mut self, offset: usize, value: u8) -> Result<(), Error>;
    /// Write a 16-bit register.
    fn write16(&mut self, offset: usize, value: u16) -> Result<(), Error>;
    /// Write a 32-bit register.
    fn write32(&mut self, offset: usize, value: u32) -> Result<(), Error>;
}

impl<T: RegisterIo + ?Sized> RegisterIo for &mut T {
    fn read8(&mut self, offset: usize) -> Result<u8, Error> {
        (**self).read8(offset)
    }

    fn read16(&mut self, offset: usize) -> Result<u16, Error> {
        (**self).read16(offset)
    }

    fn read32(&mut self, offset: usize) -> Result<u32, Error> {
        (**self).read32(offset)
    }

    fn write8(&mut self, offset: usize, value: u8) -> Result<(), Error> {
        (**self).write8(offset, value)
    }

    fn write16(&mut self, offset: usize, value: u16) -> Result<(), Error> {
        (**self).write16(offset, value)
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<(), Error> {
        (**self).write32(offset, value)
    }
}

/// A single register access recorded by [`RegisterFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read of `width` bits at `offset`.
    Read {
        /// Byte offset of the register.
        offset: usize,
        /// Access width in bits.
        width: u8,
    },
    /// Write of `value` (`width` bits) at `offset`.
    Write {
        /// Byte offset of the register.
        offset: usize,
        /// Access width in bits.
        width: u8,
        /// Value written, zero-extended.
        value: u32,
    },
}

/// In-memory register block.
///
/// Stores the register contents as plain bytes and keeps a journal of every access
/// made through [`RegisterIo`], which is what the tests inspect to check ordering.
/// Out-of-range accesses fail with [`Error::RegisterAccess`].
#[derive(Debug, Clone)]
pub struct RegisterFile {
    bytes: Vec<u8>,
    journal: Vec<Access>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// Zeroed block covering the whole diagnostic register window.
    pub fn new() -> Self {
        Self::with_size(BLOCK_SIZE)
    }

    /// Zeroed block of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            journal: Vec::new(),
        }
    }

    /// Block initialised from a snapshot of raw register bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            journal: Vec::new(),
        }
    }

    /// Raw register contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Every access since creation or the last [`RegisterFile::clear_journal`].
    pub fn journal(&self) -> &[Access] {
        &self.journal
    }

    /// Writes recorded in the journal, in order, as `(offset, width, value)`.
    pub fn writes(&self) -> impl Iterator<Item = (usize, u8, u32)> + '_ {
        self.journal.iter().filter_map(|access| match *access {
            Access::Write {
                offset,
                width,
                value,
            } => Some((offset, width, value)),
            Access::Read { .. } => None,
        })
    }

    /// Forget recorded accesses, keeping the register contents.
    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    fn slot<const N: usize>(&mut self, offset: usize) -> Result<&mut [u8; N], Error> {
        let len = self.bytes.len();
        offset
            .checked_add(N)
            .and_then(|end| self.bytes.get_mut(offset..end))
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                invalid_access(format!(
                    "{N}-byte register at {offset:#x} outside {len:#x}-byte block"
                ))
            })
    }

    fn load<const N: usize>(&mut self, offset: usize) -> Result<[u8; N], Error> {
        let value = *self.slot::<N>(offset)?;
        self.journal.push(Access::Read {
            offset,
            width: (N * 8) as u8,
        });
        Ok(value)
    }

    fn store<const N: usize>(&mut self, offset: usize, value: [u8; N], raw: u32) -> Result<(), Error> {
        *self.slot::<N>(offset)? = value;
        self.journal.push(Access::Write {
            offset,
            width: (N * 8) as u8,
            value: raw,
        });
        Ok(())
    }
}

impl RegisterIo for RegisterFile {
    fn read8(&mut self, offset: usize) -> Result<u8, Error> {
        self.load::<1>(offset).map(u8::from_le_bytes)
    }

    fn read16(&mut self, offset: usize) -> Result<u16, Error> {
        self.load::<2>(offset).map(u16::from_le_bytes)
    }

    fn read32(&mut self, offset: usize) -> Result<u32, Error> {
        self.load::<4>(offset).map(u32::from_le_bytes)
    }

    fn write8(&mut self, offset: usize, value: u8) -> Result<(), Error> {
        self.store(offset, value.to_le_bytes(), value.into())
    }

    fn write16(&mut self, offset: usize, value: u16) -> Result<(), Error> {
        self.store(offset, value.to_le_bytes(), value.into())
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<(), Error> {
        self.store(offset, value.to_le_bytes(), value)
    }
}

/// Register block reached through ordinary reads and writes of a seekable file.
///
/// Meant for snapshot images, where `base` is the offset of the block inside the
/// image. Accesses go through the file's buffered I/O, so the access width is not
/// preserved. Use [`MmioRegisters`] for a live controller.
#[derive(Debug)]
pub struct MappedRegisters<F> {
    inner: F,
    base: u64,
}

impl<F: Read + Write + Seek> MappedRegisters<F> {
    /// Wrap `inner`, treating byte `base` as register offset 0.
    pub fn new(inner: F, base: u64) -> Self {
        Self { inner, base }
    }

    /// Return the underlying file.
    pub fn into_inner(self) -> F {
        self.inner
    }

    fn seek_to(&mut self, offset: usize) -> Result<(), Error> {
        let position = u64::try_from(offset)
            .ok()
            .and_then(|offset| self.base.checked_add(offset))
            .ok_or_else(|| {
                invalid_access(format!(
                    "register at {offset:#x} past the end of the address space from base {:#x}",
                    self.base
                ))
            })?;
        self.inner.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn load<const N: usize>(&mut self, offset: usize) -> Result<[u8; N], Error> {
        self.seek_to(offset)?;
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn store<const N: usize>(&mut self, offset: usize, value: [u8; N]) -> Result<(), Error> {
        self.seek_to(offset)?;
        self.inner.write_all(&value)?;
        self.inner.flush()?;
        Ok(())
    }
}

impl<F: Read + Write + Seek> RegisterIo for MappedRegisters<F> {
    fn read8(&mut self, offset: usize) -> Result<u8, Error> {
        self.load::<1>(offset).map(u8::from_le_bytes)
    }

    fn read16(&mut self, offset: usize) -> Result<u16, Error> {
        self.load::<2>(offset).map(u16::from_le_bytes)
    }

    fn read32(&mut self, offset: usize) -> Result<u32, Error> {
        self.load::<4>(offset).map(u32::from_le_bytes)
    }

    fn write8(&mut self, offset: usize, value: u8) -> Result<(), Error> {
        self.store(offset, value.to_le_bytes())
    }

    fn write16(&mut self, offset: usize, value: u16) -> Result<(), Error> {
        self.store(offset, value.to_le_bytes())
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<(), Error> {
        self.store(offset, value.to_le_bytes())
    }
}

fn invalid_access(message: String) -> Error {
    Error::RegisterAccess(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        message,
    ))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn register_file_is_little_endian() -> Result<(), Error> {
        let mut regs = RegisterFile::new();
        regs.write32(0x68, 0x1234_5678)?;
        assert_eq!(regs.read8(0x68)?, 0x78);
        assert_eq!(regs.read16(0x6a)?, 0x1234);
        assert_eq!(&regs.as_bytes()[0x68..0x6c], &[0x78, 0x56, 0x34, 0x12]);
        Ok(())
    }

    #[test]
    fn register_file_journals_accesses_in_order() -> Result<(), Error> {
        let mut regs = RegisterFile::new();
        regs.write8(0x0f, 0x04)?;
        regs.read16(0x102)?;
        assert_eq!(
            regs.journal(),
            &[
                Access::Write {
                    offset: 0x0f,
                    width: 8,
                    value: 0x04
                },
                Access::Read {
                    offset: 0x102,
                    width: 16
                },
            ]
        );
        assert_eq!(regs.writes().collect::<Vec<_>>(), vec![(0x0f, 8, 0x04)]);
        Ok(())
    }

    #[test]
    fn register_file_rejects_out_of_range() {
        let mut regs = RegisterFile::with_size(4);
        assert!(matches!(regs.read32(2), Err(Error::RegisterAccess(_))));
        assert!(regs.journal().is_empty());
    }

    #[test]
    fn mapped_registers_honour_base_offset() -> Result<(), Error> {
        let mut regs = MappedRegisters::new(Cursor::new(vec![0u8; 0x20]), 0x10);
        regs.write16(0x02, 0xbeef)?;
        assert_eq!(regs.read16(0x02)?, 0xbeef);
        let image = regs.into_inner().into_inner();
        assert_eq!(&image[0x12..0x14], &[0xef, 0xbe]);
        Ok(())
    }

    #[test]
    fn mapped_registers_fail_past_end_of_image() {
        let mut regs = MappedRegisters::new(Cursor::new(vec![0u8; 2]), 0);
        assert!(matches!(regs.read32(0), Err(Error::RegisterAccess(_))));
    }

    #[test]
    fn huge_offsets_are_access_errors() {
        let mut regs = MappedRegisters::new(Cursor::new(vec![0u8; 4]), u64::MAX);
        assert!(matches!(regs.read8(0x7f), Err(Error::RegisterAccess(_))));
        assert!(matches!(regs.write16(0x102, 1), Err(Error::RegisterAccess(_))));

        let mut regs = RegisterFile::with_size(4);
        assert!(matches!(regs.read32(usize::MAX - 1), Err(Error::RegisterAccess(_))));
        assert!(regs.journal().is_empty());
    }
}
