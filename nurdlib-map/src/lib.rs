//! Backend-pluggable bus mapping layer.
//!
//! Modules never talk to a VME controller, a network bridge, or a chunk of
//! process memory directly; they ask [`map`] for a [`Map`] and do
//! single-cycle or block-transfer I/O through it. Which [`Backend`] actually
//! answers is picked at map time from a small closed set of compiled-in
//! options (feature-gated) plus an always-available in-process "user"
//! override meant for tests and software-only modules.

#![cfg_attr(not(debug_assertions), deny(warnings))]
#![deny(rust_2018_idioms)]

mod align;
mod backend;
mod error;

use std::sync::atomic::{AtomicBool, Ordering};

pub use align::{align, alignment};
pub use backend::Backend;
pub use error::{Error, Result};

#[cfg(feature = "backend-vme")]
pub use backend::vme::VmeBackend;

#[cfg(feature = "backend-mvlc")]
pub use backend::mvlc::MvlcBackend;

pub mod user {
    pub use crate::backend::user::{add, clear};
}

/// VME block-transfer mode, or the absence of one for plain single-cycle
/// access. Ordered here by increasing transfer width/throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BltMode {
    NoBlt,
    Blt,
    Ff,
    Mblt,
    TwoESst,
    TwoEVme,
}

/// A single liveness-check read, issued once right after a backend binds.
/// `bits == 0` means "no poke requested".
#[derive(Debug, Clone, Copy, Default)]
pub struct Poke {
    pub bits: u8,
    pub offset: usize,
}

/// A single liveness-check write, issued once right after a backend binds.
/// `bits == 0` means "no poke requested".
#[derive(Debug, Clone, Copy, Default)]
pub struct WritePoke {
    pub bits: u8,
    pub offset: usize,
    pub value: u32,
}

/// Which compiled-in backend a mapping should use, absent a user override.
#[derive(Debug, Clone)]
pub enum BackendSpec {
    /// Require a pre-registered user region; fails if none covers the
    /// requested range.
    User,
    #[cfg(feature = "backend-vme")]
    Vme { device: std::path::PathBuf },
    #[cfg(feature = "backend-mvlc")]
    Mvlc { addr: std::net::SocketAddr },
}

/// A bound, backend-agnostic window onto `bytes` bytes starting at
/// `address`. Created by [`map`], released by [`unmap`] (or just dropped).
pub struct Map {
    backend: Box<dyn Backend>,
    address: u32,
    bytes: usize,
    blt_mode: BltMode,
}

impl Map {
    pub const fn address(&self) -> u32 {
        self.address
    }

    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    pub const fn blt_mode(&self) -> BltMode {
        self.blt_mode
    }

    pub fn sicy_read(&mut self, bits: u8, offset: usize) -> Result<u32> {
        self.backend.sicy_read(bits, offset)
    }

    pub fn sicy_write(&mut self, bits: u8, offset: usize, value: u32) -> Result<()> {
        self.backend.sicy_write(bits, offset, value)
    }

    /// Performs a block-transfer read at `offset`, filling as much of `dst`
    /// as the backend has available. A hard driver failure is an `Err`; the
    /// caller (the readout engine) is responsible for turning that into the
    /// crate-wide `ERROR_DRIVER` readout-fail bit rather than aborting.
    pub fn blt_read(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        self.backend.blt_read(offset, dst)
    }

    /// As [`Map::blt_read`], but a bus error ending the burst early is
    /// folded into a short, successful read rather than propagated.
    pub fn blt_read_berr(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        self.backend.blt_read_berr(offset, dst)
    }
}

fn bind_backend(spec: &BackendSpec, address: u32, bytes: usize) -> Result<Box<dyn Backend>> {
    match spec {
        BackendSpec::User => Err(Error::NoBackend {
            address,
            blt_mode: BltMode::NoBlt,
        }),
        #[cfg(feature = "backend-vme")]
        BackendSpec::Vme { device } => {
            Ok(Box::new(backend::vme::VmeBackend::open(device, address, bytes)?))
        }
        #[cfg(feature = "backend-mvlc")]
        BackendSpec::Mvlc { addr } => Ok(Box::new(backend::mvlc::MvlcBackend::connect(
            *addr,
            address,
            std::time::Duration::from_secs(1),
        )?)),
    }
}

/// Establishes a mapping, preferring a user-registered override region,
/// falling back to the requested compiled-in backend. If either poke is
/// configured (`bits != 0`), it is issued immediately; failure there is
/// fatal to the mapping (and, per the engine's propagation policy, to the
/// owning crate).
pub fn map(
    address: u32,
    bytes: usize,
    blt_mode: BltMode,
    backend_spec: BackendSpec,
    r_poke: Poke,
    w_poke: WritePoke,
) -> Result<Map> {
    let mut backend: Box<dyn Backend> = match backend::user::find(address, bytes) {
        Some(user_backend) => Box::new(user_backend),
        None => bind_backend(&backend_spec, address, bytes)?,
    };

    if r_poke.bits != 0 {
        backend
            .sicy_read(r_poke.bits, r_poke.offset)
            .map_err(|_| Error::Poke(address))?;
    }
    if w_poke.bits != 0 {
        backend
            .sicy_write(w_poke.bits, w_poke.offset, w_poke.value)
            .map_err(|_| Error::Poke(address))?;
    }

    Ok(Map {
        backend,
        address,
        bytes,
        blt_mode,
    })
}

/// Releases a mapping. Equivalent to dropping it; kept as a named entry
/// point to mirror the pairing with [`map`] at call sites.
pub fn unmap(map: Map) {
    drop(map);
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Called once at process start. Idempotent: a second call before
/// [`shutdown`] is a no-op, matching the lazily-initialised process-wide
/// backend handles this layer sits on top of.
pub fn setup() {
    if !INITIALIZED.swap(true, Ordering::SeqCst) {
        log::debug!("map: bus layer initialised");
    }
}

/// Releases process-wide resources: registered user regions and the
/// initialised flag. Safe to call even if [`setup`] was never called.
pub fn shutdown() {
    if INITIALIZED.swap(false, Ordering::SeqCst) {
        backend::user::clear();
        log::debug!("map: bus layer shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn user_override_wins_regardless_of_blt_mode() {
        shutdown();
        user::add(0x3000, Arc::new(Mutex::new(vec![0u8; 16])));
        let mut m = map(
            0x3000,
            8,
            BltMode::Mblt,
            BackendSpec::User,
            Poke::default(),
            WritePoke::default(),
        )
        .expect("user region should satisfy the mapping");
        m.sicy_write(32, 0, 42).unwrap();
        assert_eq!(m.sicy_read(32, 0).unwrap(), 42);
        user::clear();
    }

    #[test]
    fn missing_backend_without_user_region_is_an_error() {
        user::clear();
        let result = map(
            0x9999,
            4,
            BltMode::NoBlt,
            BackendSpec::User,
            Poke::default(),
            WritePoke::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn failing_read_poke_is_fatal_to_the_mapping() {
        user::clear();
        user::add(0x4000, Arc::new(Mutex::new(vec![0u8; 4])));
        // A poke reading past the 4-byte region must fail the whole mapping.
        let result = map(
            0x4000,
            4,
            BltMode::NoBlt,
            BackendSpec::User,
            Poke { bits: 32, offset: 100 },
            WritePoke::default(),
        );
        assert!(matches!(result, Err(Error::Poke(0x4000))));
        user::clear();
    }
}
