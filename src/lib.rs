//! nurdlib — a readout engine for heterogeneous nuclear-physics DAQ crates.
//!
//! A [`daq_crate::DaqCrate`] owns an ordered list of [`module::Module`]s
//! built from a parsed [`config`] tree, drives them through a single
//! per-event cycle (latch inside dead-time, release dead-time, drain into
//! the caller's event buffer, finalize), and reconciles each module's
//! trigger counter against the crate's own. [`bus`] re-exports the
//! backend-pluggable single-cycle/block-transfer layer every hardware
//! module is built on; [`control`] exposes the same introspection a remote
//! operator console would use.

#![cfg_attr(not(debug_assertions), deny(warnings))]
#![deny(rust_2018_idioms)]

pub mod acvt;
pub mod config;
pub mod control;
pub mod counter;
pub mod daq_crate;
pub mod error;
pub mod event_buffer;
pub mod module;
pub mod pedestal;
pub mod shadow;
pub mod tag;

/// Re-export of the bus mapping layer so downstream module implementations
/// only need to depend on `nurdlib`.
pub use nurdlib_map as bus;

pub use counter::Counter;
pub use daq_crate::DaqCrate;
pub use error::ReadoutFail;
pub use event_buffer::{EventBuffer, EventConstBuffer};
pub use module::{Module, ModuleProps, ModuleSignature};

/// Registers every device module type this crate ships with. The
/// embedding application calls this once at startup before parsing any
/// config that might reference these type keywords.
pub fn register_builtin_modules() {
    module::dummy::register();
    module::caen_v775::register();
    module::sis_3820_scaler::register();
}
