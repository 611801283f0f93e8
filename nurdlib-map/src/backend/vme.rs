//! Direct-mapped VME windows: `mmap` a controller device node at a fixed
//! file offset and treat the mapping as a byte-addressable window.

use super::Backend;
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

pub struct VmeBackend {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: `ptr` points at a `mmap`ed region this struct exclusively owns for
// its lifetime; all accesses go through `&mut self`, so there is no
// concurrent access to race against.
unsafe impl Send for VmeBackend {}

impl VmeBackend {
    /// Maps `bytes` bytes of `device` starting at file offset `address`.
    pub fn open(device: &Path, address: u32, bytes: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(device)?;
        let page = page_size();
        let aligned_off = (address as usize) / page * page;
        let skew = address as usize - aligned_off;
        let map_len = bytes + skew;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                aligned_off as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let ptr = unsafe { NonNull::new_unchecked((addr as *mut u8).add(skew)) };
        Ok(Self { ptr, len: bytes })
    }

    fn byte_ptr(&self, offset: usize, width: usize) -> Result<*mut u8> {
        if offset + width > self.len {
            return Err(Error::BusError(offset));
        }
        Ok(unsafe { self.ptr.as_ptr().add(offset) })
    }
}

impl Drop for VmeBackend {
    fn drop(&mut self) {
        let page = page_size();
        let addr = self.ptr.as_ptr() as usize / page * page;
        let skew = self.ptr.as_ptr() as usize - addr;
        unsafe {
            libc::munmap(addr as *mut libc::c_void, self.len + skew);
        }
    }
}

impl Backend for VmeBackend {
    fn sicy_read(&mut self, bits: u8, offset: usize) -> Result<u32> {
        let width = super::bits_to_bytes(bits);
        let p = self.byte_ptr(offset, width)?;
        Ok(unsafe {
            match width {
                1 => p.read_volatile() as u32,
                2 => (p as *const u16).read_volatile() as u32,
                _ => (p as *const u32).read_volatile(),
            }
        })
    }

    fn sicy_write(&mut self, bits: u8, offset: usize, value: u32) -> Result<()> {
        let width = super::bits_to_bytes(bits);
        let p = self.byte_ptr(offset, width)?;
        unsafe {
            match width {
                1 => p.write_volatile(value as u8),
                2 => (p as *mut u16).write_volatile(value as u16),
                _ => (p as *mut u32).write_volatile(value),
            }
        }
        Ok(())
    }

    fn blt_read(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        let n = dst.len().min(self.len.saturating_sub(offset));
        let p = self.byte_ptr(offset, 0)?;
        unsafe {
            std::ptr::copy_nonoverlapping(p, dst.as_mut_ptr(), n);
        }
        Ok(n)
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
