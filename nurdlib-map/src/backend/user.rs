//! The "user" backend: mappings satisfied from in-process memory registered
//! by the application, used by tests and by modules that have no real bus
//! (e.g. a software scaler fed from another thread).

use super::Backend;
use crate::error::Result;
use std::sync::{Arc, Mutex, OnceLock};

struct Region {
    address: u32,
    bytes: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

fn registry() -> &'static Mutex<Vec<Region>> {
    static REGISTRY: OnceLock<Mutex<Vec<Region>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers a user-owned memory region at `address`. The library never
/// frees `data`; the caller's `Arc` keeps it alive for as long as it wants
/// mappings into it to keep working.
pub fn add(address: u32, data: Arc<Mutex<Vec<u8>>>) {
    let bytes = data.lock().expect("user region mutex poisoned").len();
    registry()
        .lock()
        .expect("user region registry poisoned")
        .push(Region {
            address,
            bytes,
            data,
        });
}

/// Drops all registered regions. Does not affect the caller's own handles.
pub fn clear() {
    registry()
        .lock()
        .expect("user region registry poisoned")
        .clear();
}

/// If the first registered region containing `[address, address+bytes)` in
/// full, returns a backend bound to it at the matching local offset.
pub fn find(address: u32, bytes: usize) -> Option<UserBackend> {
    let reg = registry().lock().expect("user region registry poisoned");
    reg.iter().find_map(|r| {
        let end = r.address as u64 + r.bytes as u64;
        let want_end = address as u64 + bytes as u64;
        if r.address as u64 <= address as u64 && want_end <= end {
            Some(UserBackend {
                data: Arc::clone(&r.data),
                base: (address - r.address) as usize,
            })
        } else {
            None
        }
    })
}

pub struct UserBackend {
    data: Arc<Mutex<Vec<u8>>>,
    base: usize,
}

impl Backend for UserBackend {
    fn sicy_read(&mut self, bits: u8, offset: usize) -> Result<u32> {
        let width = super::bits_to_bytes(bits);
        let data = self.data.lock().expect("user region mutex poisoned");
        let at = self.base + offset;
        let mut raw = [0u8; 4];
        raw[..width].copy_from_slice(&data[at..at + width]);
        Ok(match width {
            1 => raw[0] as u32,
            2 => u16::from_ne_bytes([raw[0], raw[1]]) as u32,
            _ => u32::from_ne_bytes(raw),
        })
    }

    fn sicy_write(&mut self, bits: u8, offset: usize, value: u32) -> Result<()> {
        let width = super::bits_to_bytes(bits);
        let mut data = self.data.lock().expect("user region mutex poisoned");
        let at = self.base + offset;
        let raw = value.to_ne_bytes();
        data[at..at + width].copy_from_slice(&raw[..width]);
        Ok(())
    }

    fn blt_read(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        let data = self.data.lock().expect("user region mutex poisoned");
        let at = self.base + offset;
        let n = dst.len().min(data.len().saturating_sub(at));
        dst[..n].copy_from_slice(&data[at..at + n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_request_binds_and_round_trips() {
        clear();
        add(0x1000, Arc::new(Mutex::new(vec![0u8; 64])));
        let mut b = find(0x1004, 4).expect("region should be found");
        b.sicy_write(32, 0, 0xdead_beef).unwrap();
        assert_eq!(b.sicy_read(32, 0).unwrap(), 0xdead_beef);
        clear();
    }

    #[test]
    fn request_exceeding_region_is_rejected() {
        clear();
        add(0x2000, Arc::new(Mutex::new(vec![0u8; 4])));
        assert!(find(0x2000, 8).is_none());
        clear();
    }
}
