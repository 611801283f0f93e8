//! Readout failure bits and the fatal error types that abort a crate
//! outright rather than flowing through the per-event fail bitmask.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Accumulated over a single `readout_dt`/`readout` pair and surfaced
    /// to the application at `readout`'s return. Non-zero never aborts the
    /// engine; the application decides whether to keep or drop the event.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReadoutFail: u32 {
        const GENERAL                 = 1 << 0;
        const DATA_CORRUPT            = 1 << 1;
        const DATA_MISSING            = 1 << 2;
        const DATA_TOO_MUCH           = 1 << 3;
        const EVENT_COUNTER_MISMATCH  = 1 << 4;
        const ERROR_DRIVER            = 1 << 5;
        const UNEXPECTED_TRIGGER      = 1 << 6;
    }
}

/// Errors raised during configuration or `init_slow` that abort the whole
/// crate. Transient per-event problems are [`ReadoutFail`] bits instead.
#[derive(Debug, Error)]
pub enum CrateError {
    #[error("{key}: {message} ({path}:{line})")]
    Config {
        key: String,
        message: String,
        path: String,
        line: u32,
    },
    #[error("include cycle detected: {0} already being included")]
    IncludeCycle(String),
    #[error("unknown module type keyword: {0}")]
    UnknownModuleType(String),
    #[error("{module}: identity mismatch: {detail}")]
    Identity { module: String, detail: String },
    #[error("{module}: liveness poke failed while mapping the device")]
    Poke { module: String },
    #[error("bus mapping error: {0}")]
    Map(#[from] nurdlib_map::Error),
    #[error("{module}: init_slow requested a retry but the retry budget ({attempts} attempts) was exhausted")]
    InitRetryExhausted { module: String, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, CrateError>;
