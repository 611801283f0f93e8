//! SIS3820 32-channel scaler: a counting-only module with no trigger
//! timing of its own. Latching mode gates whether the crate tracks its
//! event counter at all (free-running scalers never wrap in step with
//! the rest of the crate).

use log::debug;

use nurdlib_map::{BltMode, Map, Poke, WritePoke};

use crate::config::ConfigBlock;
use crate::counter::Counter;
use crate::error::{CrateError, ReadoutFail};
use crate::event_buffer::{EventBuffer, EventConstBuffer};
use crate::module::{backend, registry, ModuleProps, ModuleSignature};
use crate::pedestal::Pedestal;

const CHANNELS: usize = 32;
const MAP_BYTES: usize = 0x100;

const REG_COUNTER_BASE: u32 = 0x00;
const REG_FIFO_WORD_COUNT: u32 = 0xb0;
const REG_CONTROL: u32 = 0x60;

static SIGNATURE: [ModuleSignature; 1] = [ModuleSignature::new(0x0000_0000, 0xffff_0000, 0x3820_0000)];

pub struct Sis3820ScalerModule {
    map: Map,
    blt_mode: BltMode,
    is_latching: bool,
}

impl Sis3820ScalerModule {
    fn create(block: &ConfigBlock) -> Result<Box<dyn ModuleProps>, CrateError> {
        let address = block.param_int32(0)? as u32;
        let blt_mode = match block.get_keyword("blt_mode", &["BLT", "MBLT", "NOBLT"])? {
            "BLT" => BltMode::Blt,
            "MBLT" => BltMode::Mblt,
            _ => BltMode::NoBlt,
        };
        let is_latching = block.get_boolean("latching").unwrap_or(false);

        let backend_spec = backend::resolve(block)?;
        let map = nurdlib_map::map(
            address,
            MAP_BYTES,
            blt_mode,
            backend_spec,
            Poke::default(),
            WritePoke::default(),
        )?;

        Ok(Box::new(Self {
            map,
            blt_mode,
            is_latching,
        }))
    }
}

impl ModuleProps for Sis3820ScalerModule {
    fn type_name(&self) -> &'static str {
        "SIS_3820_SCALER"
    }

    fn check_empty(&mut self) -> ReadoutFail {
        match self.map.sicy_read(32, REG_FIFO_WORD_COUNT as usize) {
            Ok(0) => ReadoutFail::empty(),
            Ok(_) => ReadoutFail::DATA_TOO_MUCH,
            Err(_) => ReadoutFail::ERROR_DRIVER,
        }
    }

    fn get_signature(&self) -> &[ModuleSignature] {
        &SIGNATURE
    }

    fn init_slow(&mut self) -> Result<bool, CrateError> {
        Ok(true)
    }

    fn init_fast(&mut self) -> Result<(), CrateError> {
        debug!("SIS_3820_SCALER: blt_mode={:?} latching={}", self.blt_mode, self.is_latching);
        self.map.sicy_write(32, REG_CONTROL as usize, if self.is_latching { 1 } else { 0 })?;
        Ok(())
    }

    fn readout_dt(&mut self) -> ReadoutFail {
        ReadoutFail::empty()
    }

    fn readout(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail {
        let mut words = [0u32; CHANNELS];
        for (channel, slot) in words.iter_mut().enumerate() {
            *slot = match self.map.sicy_read(32, REG_COUNTER_BASE as usize + channel * 4) {
                Ok(v) => v,
                Err(_) => return ReadoutFail::ERROR_DRIVER,
            };
        }
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        if buf.write(&bytes) {
            ReadoutFail::empty()
        } else {
            ReadoutFail::DATA_TOO_MUCH
        }
    }

    fn parse_data(&mut self, mut data: EventConstBuffer<'_>, _crate_counter: Counter, _pedestals: Option<&mut [Pedestal]>) -> ReadoutFail {
        if data.bytes() != CHANNELS * 4 {
            return ReadoutFail::DATA_CORRUPT;
        }
        data.advance(0);
        ReadoutFail::empty()
    }

    /// Free-running unless `latching` is set — a non-latching scaler never
    /// wraps in step with the rest of the crate, so it reports no counter
    /// at all rather than one that would spuriously mismatch.
    fn event_counter(&self) -> Counter {
        if !self.is_latching {
            return Counter::NONE;
        }
        match self.map.sicy_read(32, REG_COUNTER_BASE as usize) {
            Ok(v) => Counter::new(v, 0xffff_ffff),
            Err(_) => Counter::NONE,
        }
    }

    fn apply_config(&mut self, snippet: &ConfigBlock) -> Result<(), CrateError> {
        if let Ok(is_latching) = snippet.get_boolean("latching") {
            self.is_latching = is_latching;
        }
        Ok(())
    }

    fn flags(&self) -> u32 {
        0
    }
}

/// Registers this type's constructor; called once at process start by the
/// embedding application alongside every other device module it links in.
pub fn register() {
    registry::register("SIS_3820_SCALER", Sis3820ScalerModule::create);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_snippet;
    use std::sync::{Arc, Mutex};

    fn user_backed(address: u32) {
        nurdlib_map::user::clear();
        nurdlib_map::user::add(address, Arc::new(Mutex::new(vec![0u8; MAP_BYTES])));
    }

    #[test]
    fn non_latching_is_the_default() {
        user_backed(0x6000);
        let block = parse_snippet("SIS_3820_SCALER(0x6000) { blt_mode = BLT }").unwrap();
        let s = block.get_block("SIS_3820_SCALER").unwrap();
        let m = Sis3820ScalerModule::create(s).unwrap();
        let boxed: Box<dyn ModuleProps> = m;
        assert_eq!(boxed.type_name(), "SIS_3820_SCALER");
        nurdlib_map::user::clear();
    }

    #[test]
    fn readout_packs_one_word_per_channel() {
        user_backed(0x6100);
        let block = parse_snippet("SIS_3820_SCALER(0x6100) { blt_mode = MBLT latching = true }").unwrap();
        let s = block.get_block("SIS_3820_SCALER").unwrap();
        let mut m = Sis3820ScalerModule::create(s).unwrap();
        m.init_slow().unwrap();
        m.init_fast().unwrap();

        let mut store = [0u8; CHANNELS * 4];
        let mut buf = EventBuffer::new(&mut store);
        let fail = m.readout(&mut buf);
        assert!(fail.is_empty());
        assert_eq!(buf.bytes(), 0);
        nurdlib_map::user::clear();
    }

    #[test]
    fn check_empty_flags_a_nonzero_fifo() {
        user_backed(0x6200);
        let block = parse_snippet("SIS_3820_SCALER(0x6200) { blt_mode = NOBLT }").unwrap();
        let s = block.get_block("SIS_3820_SCALER").unwrap();
        let mut m = Sis3820ScalerModule::create(s).unwrap();
        m.map.sicy_write(32, REG_FIFO_WORD_COUNT as usize, 4).unwrap();
        assert_eq!(m.check_empty(), ReadoutFail::DATA_TOO_MUCH);
        nurdlib_map::user::clear();
    }
}
