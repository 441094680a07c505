//! Live register access through a memory mapping of `/dev/mem`.
#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

use tracing::debug;

use super::{RegisterIo, invalid_access};
use crate::Error;

/// Register block mapped from a physical-memory device such as `/dev/mem`.
///
/// Every access is one volatile load or store of the register's width, so the
/// controller sees the same bus cycles a kernel driver would issue. Accesses must
/// be naturally aligned. The window is unmapped on drop.
#[derive(Debug)]
pub struct MmioRegisters {
    map: NonNull<u8>,
    map_len: usize,
    lead: usize,
    len: usize,
    _device: File,
}

// The mapping is owned by this value and only touched through `&mut self`.
unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    /// Map `len` bytes of `device` starting at physical address `base`.
    ///
    /// `base` does not have to be page aligned.
    ///
    /// # Errors
    ///
    /// [`Error::RegisterAccess`] if the device cannot be opened or mapped.
    pub fn open(device: impl AsRef<Path>, base: u64, len: usize) -> Result<Self, Error> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(device)?;

        // SAFETY: sysconf has no preconditions.
        let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            page if page > 0 => page as u64,
            _ => 4096,
        };
        let aligned = base & !(page - 1);
        let lead = (base - aligned) as usize;
        let map_len = lead
            .checked_add(len)
            .ok_or_else(|| invalid_access(format!("window of {len:#x} bytes is too large")))?;
        let offset = libc::off_t::try_from(aligned)
            .map_err(|_| invalid_access(format!("physical address {base:#x} cannot be mapped")))?;

        // SAFETY: a new shared mapping of an open descriptor, checked for failure below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                device.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::RegisterAccess(std::io::Error::last_os_error()));
        }
        let map = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| invalid_access("mmap returned a null window".to_owned()))?;
        debug!("mapped {len:#x} register bytes at {base:#x}");
        Ok(Self {
            map,
            map_len,
            lead,
            len,
            _device: device,
        })
    }

    fn register<T>(&self, offset: usize) -> Result<*mut T, Error> {
        let size = size_of::<T>();
        let in_window = offset.checked_add(size).is_some_and(|end| end <= self.len);
        if !in_window || (self.lead + offset) % size != 0 {
            return Err(invalid_access(format!(
                "{size}-byte register at {offset:#x} is misaligned or outside the {:#x}-byte window",
                self.len
            )));
        }
        // SAFETY: lead + offset + size <= lead + len == map_len.
        Ok(unsafe { self.map.as_ptr().add(self.lead + offset) }.cast::<T>())
    }

    fn load<T>(&mut self, offset: usize) -> Result<T, Error> {
        let register = self.register::<T>(offset)?;
        // SAFETY: inside the live mapping and aligned for T.
        Ok(unsafe { register.read_volatile() })
    }

    fn store<T>(&mut self, offset: usize, value: T) -> Result<(), Error> {
        let register = self.register::<T>(offset)?;
        // SAFETY: inside the live mapping and aligned for T.
        unsafe { register.write_volatile(value) };
        Ok(())
    }
}

impl Drop for MmioRegisters {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the region mapped in `open`, which nothing else uses.
        unsafe { libc::munmap(self.map.as_ptr().cast(), self.map_len) };
    }
}

impl RegisterIo for MmioRegisters {
    fn read8(&mut self, offset: usize) -> Result<u8, Error> {
        self.load(offset)
    }

    fn read16(&mut self, offset: usize) -> Result<u16, Error> {
        self.load(offset).map(u16::from_le)
    }

    fn read32(&mut self, offset: usize) -> Result<u32, Error> {
        self.load(offset).map(u32::from_le)
    }

    fn write8(&mut self, offset: usize, value: u8) -> Result<(), Error> {
        self.store(offset, value)
    }

    fn write16(&mut self, offset: usize, value: u16) -> Result<(), Error> {
        self.store(offset, value.to_le())
    }

    fn write32(&mut self, offset: usize, value: u32) -> Result<(), Error> {
        self.store(offset, value.to_le())
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;

    /// Sparse file standing in for physical memory. Regular files map the same way.
    fn scratch_file(name: &str, len: u64) -> std::io::Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("musb-diag-{name}-{}", std::process::id()));
        File::create(&path)?.set_len(len)?;
        Ok(path)
    }

    #[test]
    fn accesses_land_at_unaligned_base() -> Result<(), Error> {
        let path = scratch_file("mmio-base", 0x20000)?;
        let mut regs = MmioRegisters::open(&path, 0x10100, 0x400)?;
        regs.write16(0x102, 0x000a)?;
        regs.write8(0x0f, 0x04)?;
        assert_eq!(regs.read16(0x102)?, 0x000a);
        assert_eq!(regs.read32(0x0c)?, 0x0400_0000);
        drop(regs);

        let image = std::fs::read(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(&image[0x10202..0x10204], &[0x0a, 0x00]);
        assert_eq!(image[0x1010f], 0x04);
        Ok(())
    }

    #[test]
    fn misaligned_or_outside_window_is_refused() -> Result<(), Error> {
        let path = scratch_file("mmio-bounds", 0x2000)?;
        let mut regs = MmioRegisters::open(&path, 0, 0x400)?;
        assert!(matches!(regs.read16(0x101), Err(Error::RegisterAccess(_))));
        assert!(matches!(regs.read32(0x3fe), Err(Error::RegisterAccess(_))));
        assert!(matches!(regs.write8(0x400, 1), Err(Error::RegisterAccess(_))));
        assert!(matches!(regs.read8(usize::MAX), Err(Error::RegisterAccess(_))));
        drop(regs);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn missing_device_is_an_access_error() {
        let result = MmioRegisters::open("/nonexistent/musb-diag/mem", 0, 0x400);
        assert!(matches!(result, Err(Error::RegisterAccess(_))));
    }
}
