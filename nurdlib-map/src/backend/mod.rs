//! Pluggable transfer backends behind a single [`Backend`] trait.
//!
//! Every backend turns single-cycle and block-transfer requests for some
//! byte range into whatever its medium actually requires (a raw memory
//! load/store, an `ioctl`, a round trip over a socket). The mapping layer
//! never inspects which backend it is holding; it only ever sees the trait.

use crate::error::{Error, Result};

pub mod user;

#[cfg(feature = "backend-vme")]
pub mod vme;

#[cfg(feature = "backend-mvlc")]
pub mod mvlc;

/// A single bound transfer backend, already positioned at the mapping's base
/// address. All offsets given to these methods are relative to that base.
pub trait Backend: Send {
    fn sicy_read(&mut self, bits: u8, offset: usize) -> Result<u32>;
    fn sicy_write(&mut self, bits: u8, offset: usize, value: u32) -> Result<()>;

    /// Returns the number of bytes actually transferred, or a negative
    /// driver error code translated into [`Error::Driver`] by the caller.
    fn blt_read(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize>;

    /// As [`Backend::blt_read`], but a backend-reported bus error ending the
    /// burst early is not a failure: the caller wants whatever arrived
    /// before the error. Default implementation treats them identically,
    /// which is correct for backends that cannot distinguish the two.
    fn blt_read_berr(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        match self.blt_read(offset, dst) {
            Err(Error::BusError(n)) => Ok(n),
            other => other,
        }
    }
}

pub(crate) fn bits_to_bytes(bits: u8) -> usize {
    match bits {
        8 => 1,
        16 => 2,
        32 => 4,
        _ => panic!("unsupported single-cycle width: {bits} bits"),
    }
}
