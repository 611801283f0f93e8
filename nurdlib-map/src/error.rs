use crate::BltMode;
use thiserror::Error;

/// Errors raised while establishing or using a bus mapping.
///
/// [`Error::Poke`] and [`Error::BusError`] are fatal to the owning crate per
/// the propagation policy: a liveness poke is only ever issued once, right
/// after a backend binds a region, and a failure there means the hardware
/// (or its proxy) is not answering at all.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no backend compiled in can satisfy address {address:#010x} (blt={blt_mode:?})")]
    NoBackend {
        address: u32,
        blt_mode: BltMode,
    },
    #[error("liveness poke failed for address {0:#010x}")]
    Poke(u32),
    #[error("bus error at offset {0:#x}")]
    BusError(usize),
    #[error("backend-reported driver error (code {0})")]
    Driver(i32),
    #[error("vme backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
