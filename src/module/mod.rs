//! The module contract every front-end device implements, the state a
//! crate keeps per module instance, and the type-keyword registry used to
//! construct modules out of parsed config.

pub mod backend;
pub mod caen_v775;
pub mod dummy;
pub mod registry;
pub mod sis_3820_scaler;

use std::sync::Arc;
use std::sync::Mutex;

use crate::config::ConfigBlock;
use crate::counter::Counter;
use crate::error::{CrateError, ReadoutFail};
use crate::event_buffer::{EventBuffer, EventConstBuffer};
use crate::pedestal::Pedestal;
use crate::shadow::ShadowDoubleBuffer;

/// A module declares `EARLY_DT` if it is safe to `readout` while the
/// hardware simultaneously accepts new triggers, i.e. all state `readout`
/// needs was already latched by `readout_dt`.
pub const EARLY_DT: u32 = 1 << 0;

/// Mask/fixed-bits pattern identifying a module's first payload word, used
/// by the crate to decide whether a `BARRIER` is needed between two
/// adjacent modules in a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSignature {
    pub id_mask: u32,
    pub fixed_mask: u32,
    pub fixed_value: u32,
}

impl ModuleSignature {
    pub const fn new(id_mask: u32, fixed_mask: u32, fixed_value: u32) -> Self {
        Self {
            id_mask,
            fixed_mask,
            fixed_value,
        }
    }

    /// `true` if `word` could plausibly be this module's first payload
    /// word under this signature.
    pub const fn matches(&self, word: u32) -> bool {
        (word & self.fixed_mask) == self.fixed_value
    }

    /// Two signature sets are ambiguous (need a `BARRIER` between them)
    /// when some word could match both.
    pub fn collides(a: &[ModuleSignature], b: &[ModuleSignature]) -> bool {
        for sa in a {
            for sb in b {
                let shared_mask = sa.fixed_mask & sb.fixed_mask;
                if (sa.fixed_value & shared_mask) == (sb.fixed_value & shared_mask) {
                    return true;
                }
            }
        }
        false
    }
}

/// Client-facing description of one documented hardware register, for
/// remote display via the control surface.
#[derive(Debug, Clone)]
pub struct RegisterListEntry {
    pub name: String,
    pub address: u32,
    pub bits: u8,
    pub array_length: u32,
}

/// The capability vtable every device type implements. Required methods
/// model hardware that always exists; optional methods default to a
/// no-op/empty implementation, mirroring a `NULL` function pointer.
pub trait ModuleProps: Send {
    fn type_name(&self) -> &'static str;

    fn check_empty(&mut self) -> ReadoutFail;
    fn get_signature(&self) -> &[ModuleSignature];
    fn init_slow(&mut self) -> Result<bool, CrateError>;
    fn init_fast(&mut self) -> Result<(), CrateError>;
    fn readout_dt(&mut self) -> ReadoutFail;
    fn readout(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail;

    /// Parses the bytes this module's own `readout` just wrote: verifies
    /// framing, matches any payload-embedded counter against
    /// `crate_counter`, and — when `pedestals` is `Some` — feeds per-channel
    /// samples into the pedestal ring.
    fn parse_data(&mut self, data: EventConstBuffer<'_>, crate_counter: Counter, pedestals: Option<&mut [Pedestal]>) -> ReadoutFail;

    fn destroy(&mut self) {}
    fn deinit(&mut self) {}

    fn post_init(&mut self) -> Result<(), CrateError> {
        Ok(())
    }

    /// The device's own latched trigger counter, if it has one.
    /// `Counter::NONE` (the default) opts this module out of
    /// `EVENT_COUNTER_MISMATCH` reconciliation entirely.
    fn event_counter(&self) -> Counter {
        Counter::NONE
    }

    /// How many events' worth of data `data` (as just produced by
    /// `readout`) represents, when this module can tell. `None` opts the
    /// module out of the readout-time produced-vs-expected check.
    fn event_count_of(&self, _data: EventConstBuffer<'_>) -> Option<u32> {
        None
    }

    /// Merges a live-reconfiguration snippet (`config Crate.N.Module = {...}`)
    /// into this module's own settings, before the engine re-runs
    /// `deinit`/`init_fast`/`post_init`. The default no-op is correct for
    /// modules with nothing reconfigurable at runtime.
    fn apply_config(&mut self, _snippet: &ConfigBlock) -> Result<(), CrateError> {
        Ok(())
    }

    fn readout_shadow(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail {
        self.readout(buf)
    }

    fn memtest(&mut self) {}

    fn use_pedestals(&mut self, _pedestals: &[Pedestal]) {}

    fn zero_suppress(&mut self, _enable: bool) {}

    /// Set by the engine via ACVT when this module is `EARLY_DT` and has
    /// reported "had to wait" during `readout_dt`.
    fn cvt_set(&mut self, _ns: u32) {}

    fn flags(&self) -> u32 {
        0
    }

    fn supports_shadow(&self) -> bool {
        false
    }

    /// `register_list_pack`: the documented registers this module exposes
    /// for remote readback. Empty for modules with no readable register
    /// map (e.g. pure scalers).
    fn register_list(&self) -> Vec<RegisterListEntry> {
        Vec::new()
    }

    /// Reads one register entry (possibly one element of an array entry)
    /// for `register_array_get`. Only called for addresses drawn from
    /// `register_list`.
    fn register_read(&mut self, _address: u32, _bits: u8) -> Result<u32, CrateError> {
        Ok(0)
    }

    /// `sub_module_pack`: names of chained slave boards addressed through
    /// this module (e.g. a CMVLC fan-out), for `crate_array_get`.
    fn sub_modules(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Per-instance engine-owned state wrapped around a device's
/// [`ModuleProps`] implementation.
pub struct Module {
    pub id: usize,
    pub props: Box<dyn ModuleProps>,
    pub event_max: u32,
    pub event_counter: Counter,
    pub this_minus_crate: u32,
    pub crate_counter_prev: Counter,
    pub result: ReadoutFail,
    pub skip_dt: bool,
    pub log_level_override: Option<log::Level>,
    pub pedestals: Vec<Pedestal>,
    pub do_pedestals: bool,
    pub shadow: Option<Arc<Mutex<ShadowDoubleBuffer>>>,
}

impl Module {
    pub fn new(id: usize, props: Box<dyn ModuleProps>, event_max: u32) -> Self {
        let supports_shadow = props.supports_shadow();
        Self {
            id,
            props,
            event_max,
            event_counter: Counter::NONE,
            this_minus_crate: 0,
            crate_counter_prev: Counter::NONE,
            result: ReadoutFail::empty(),
            skip_dt: false,
            log_level_override: None,
            pedestals: Vec::new(),
            do_pedestals: false,
            shadow: if supports_shadow {
                Some(Arc::new(Mutex::new(ShadowDoubleBuffer::new())))
            } else {
                None
            },
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.props.type_name()
    }

    /// `crate.counter - module.counter - this_minus_crate`, the quantity
    /// `EVENT_COUNTER_MISMATCH` is raised against when non-zero.
    pub fn counter_diff(&self, crate_counter: Counter) -> u32 {
        crate::counter::module_counter_diff(crate_counter, self.event_counter, self.this_minus_crate)
    }

    pub fn is_early_dt(&self) -> bool {
        self.props.flags() & EARLY_DT != 0
    }
}

/// Constructs module state from a parsed config block. Implemented once
/// per device type and registered under its type keyword.
pub type ModuleFactory = fn(&ConfigBlock) -> Result<Box<dyn ModuleProps>, CrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_fixed_values_collide() {
        let a = [ModuleSignature::new(0xff00_0000, 0xff00_0000, 0x1000_0000)];
        let b = [ModuleSignature::new(0xff00_0000, 0xff00_0000, 0x1000_0000)];
        assert!(ModuleSignature::collides(&a, &b));
    }

    #[test]
    fn disjoint_fixed_values_do_not_collide() {
        let a = [ModuleSignature::new(0xff00_0000, 0xff00_0000, 0x1000_0000)];
        let b = [ModuleSignature::new(0xff00_0000, 0xff00_0000, 0x2000_0000)];
        assert!(!ModuleSignature::collides(&a, &b));
    }

    #[test]
    fn signature_matches_checks_fixed_bits_only() {
        let sig = ModuleSignature::new(0x00ff_0000, 0xff00_0000, 0x1000_0000);
        assert!(sig.matches(0x1042_abcd));
        assert!(!sig.matches(0x2042_abcd));
    }
}
