//! CAEN V775 32-channel TDC: a VME-mapped, block-transfer-readout module
//! with a software event buffer deep enough that `readout` can run
//! concurrently with the next trigger (`EARLY_DT`).

use log::{debug, warn};

use nurdlib_map::{BltMode, Map, Poke, WritePoke};

use crate::config::{ConfigBlock, Unit};
use crate::counter::Counter;
use crate::error::{CrateError, ReadoutFail};
use crate::event_buffer::{EventBuffer, EventConstBuffer};
use crate::module::{backend, registry, ModuleProps, ModuleSignature, RegisterListEntry};
use crate::pedestal::Pedestal;

/// 34 words/event, 32 events of onboard buffer (manual p. 16).
const EVENT_MAX: u32 = 32;
const WORDS_PER_EVENT: usize = 34;
const MAP_BYTES: usize = 0x1100;

const REG_OUTPUT_BUFFER: u32 = 0x0000;
const REG_BIT_SET_2: u32 = 0x1032;
const REG_STATUS: u32 = 0x100e;
const REG_EVENT_COUNTER: u32 = 0x1010;
const REG_THRESHOLD_BASE: u32 = 0x1080;

const BS2_INVALID_INCL: u32 = 0x0020;
const BS2_NEVER_EMPTY: u32 = 0x1000;
const BS2_COMMON_STOP: u32 = 0x0400;

/// Top 2 bits of each output word: `00` data, `01` header, `11` trailer —
/// the same boundary the module's own first-word signature (below) keys
/// off of.
const WORD_TYPE_MASK: u32 = 0xc000_0000;
const WORD_TYPE_DATA: u32 = 0x0000_0000;
const WORD_CHANNEL_SHIFT: u32 = 17;
const WORD_CHANNEL_MASK: u32 = 0x1f;
const WORD_VALUE_MASK: u32 = 0x0fff;

static SIGNATURE: [ModuleSignature; 2] = [
    ModuleSignature::new(0x00ff_0000, 0xff80_0000, 0x4000_0000),
    ModuleSignature::new(0x00ff_0000, 0xff80_0000, 0xc000_0000),
];

pub struct CaenV775Module {
    map: Map,
    time_range_ns: i32,
    common_stop: bool,
}

impl CaenV775Module {
    fn create(block: &ConfigBlock) -> Result<Box<dyn ModuleProps>, CrateError> {
        let address = block.get_uint32("address", Unit::None, 0, u32::MAX)?;
        let time_range_ns = block.get_int32("time_range", Unit::Ns, 140, 1200)?;
        let common_stop = block.get_boolean("common_stop").unwrap_or(true);

        let backend_spec = backend::resolve(block)?;
        let map = nurdlib_map::map(
            address,
            MAP_BYTES,
            BltMode::Mblt,
            backend_spec,
            Poke { bits: 16, offset: REG_STATUS as usize },
            WritePoke::default(),
        )?;

        Ok(Box::new(Self {
            map,
            time_range_ns,
            common_stop,
        }))
    }

    fn bit_set_2(&self) -> u32 {
        let mut bits = BS2_INVALID_INCL | BS2_NEVER_EMPTY;
        if self.common_stop {
            bits |= BS2_COMMON_STOP;
        }
        bits
    }
}

impl ModuleProps for CaenV775Module {
    fn type_name(&self) -> &'static str {
        "CAEN_V775"
    }

    fn check_empty(&mut self) -> ReadoutFail {
        match self.map.sicy_read(16, REG_STATUS as usize) {
            Ok(status) if status & 0x0002 == 0 => ReadoutFail::empty(),
            Ok(_) => ReadoutFail::DATA_MISSING,
            Err(_) => ReadoutFail::ERROR_DRIVER,
        }
    }

    fn get_signature(&self) -> &[ModuleSignature] {
        &SIGNATURE
    }

    fn init_slow(&mut self) -> Result<bool, CrateError> {
        self.map.sicy_write(16, REG_BIT_SET_2 as usize, self.bit_set_2())?;
        Ok(true)
    }

    fn init_fast(&mut self) -> Result<(), CrateError> {
        debug!("CAEN_V775: time range {} ns", self.time_range_ns);
        Ok(())
    }

    fn readout_dt(&mut self) -> ReadoutFail {
        match self.map.sicy_read(16, REG_STATUS as usize) {
            Ok(status) if status & 0x0001 != 0 => ReadoutFail::empty(),
            Ok(_) => ReadoutFail::DATA_MISSING,
            Err(_) => ReadoutFail::ERROR_DRIVER,
        }
    }

    fn readout(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail {
        let max_bytes = (WORDS_PER_EVENT * EVENT_MAX as usize * 4).min(buf.bytes());
        let mut scratch = vec![0u8; max_bytes];
        let got = match self.map.blt_read_berr(REG_OUTPUT_BUFFER as usize, &mut scratch) {
            Ok(n) => n,
            Err(_) => return ReadoutFail::ERROR_DRIVER,
        };
        if !buf.write(&scratch[..got]) {
            return ReadoutFail::DATA_TOO_MUCH;
        }
        ReadoutFail::empty()
    }

    fn readout_shadow(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail {
        self.readout(buf)
    }

    fn parse_data(&mut self, mut data: EventConstBuffer<'_>, _crate_counter: Counter, pedestals: Option<&mut [Pedestal]>) -> ReadoutFail {
        if data.bytes() % 4 != 0 {
            return ReadoutFail::DATA_CORRUPT;
        }
        if let Some(pedestals) = pedestals {
            for word in data.as_slice().chunks_exact(4) {
                let word = u32::from_ne_bytes(word.try_into().unwrap());
                if word & WORD_TYPE_MASK != WORD_TYPE_DATA {
                    continue;
                }
                let channel = ((word >> WORD_CHANNEL_SHIFT) & WORD_CHANNEL_MASK) as usize;
                let value = (word & WORD_VALUE_MASK) as u16;
                if let Some(p) = pedestals.get_mut(channel) {
                    p.add(value);
                }
            }
        }
        data.advance(0);
        ReadoutFail::empty()
    }

    fn event_counter(&self) -> Counter {
        match self.map.sicy_read(32, REG_EVENT_COUNTER as usize) {
            Ok(v) => Counter::new(v, 0xffff_ffff),
            Err(_) => Counter::NONE,
        }
    }

    fn use_pedestals(&mut self, pedestals: &[Pedestal]) {
        for (channel, p) in pedestals.iter().enumerate().take(32) {
            if let Err(e) = self.map.sicy_write(16, REG_THRESHOLD_BASE as usize + channel * 2, p.threshold()) {
                warn!("CAEN_V775: failed to push pedestal threshold for channel {channel}: {e}");
                break;
            }
        }
    }

    fn apply_config(&mut self, snippet: &ConfigBlock) -> Result<(), CrateError> {
        if let Ok(time_range_ns) = snippet.get_int32("time_range", Unit::Ns, 140, 1200) {
            self.time_range_ns = time_range_ns;
        }
        if let Ok(common_stop) = snippet.get_boolean("common_stop") {
            self.common_stop = common_stop;
        }
        Ok(())
    }

    fn flags(&self) -> u32 {
        crate::module::EARLY_DT
    }

    fn supports_shadow(&self) -> bool {
        true
    }

    fn register_list(&self) -> Vec<RegisterListEntry> {
        vec![
            RegisterListEntry {
                name: "bit_set_2".into(),
                address: REG_BIT_SET_2,
                bits: 16,
                array_length: 1,
            },
            RegisterListEntry {
                name: "event_counter".into(),
                address: REG_EVENT_COUNTER,
                bits: 32,
                array_length: 1,
            },
            RegisterListEntry {
                name: "threshold".into(),
                address: REG_THRESHOLD_BASE,
                bits: 16,
                array_length: 32,
            },
        ]
    }

    fn register_read(&mut self, address: u32, bits: u8) -> Result<u32, CrateError> {
        self.map.sicy_read(bits, address as usize).map_err(CrateError::from)
    }
}

/// Registers this type's constructor; called once at process start by the
/// embedding application alongside every other device module it links in.
pub fn register() {
    registry::register("CAEN_V775", CaenV775Module::create);
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
    fn create_pokes_bit_set_2_with_common_stop_by_default() {
        user_backed(0x5000);
        let block = parse_snippet("CAEN_V775(0) { address = 0x5000 time_range = 300 ns }").unwrap();
        let v775 = block.get_block("CAEN_V775").unwrap();
        let mut m = CaenV775Module::create(v775).unwrap();
        m.init_slow().unwrap();
        let bits = m.register_read(REG_BIT_SET_2, 16).unwrap();
        assert_eq!(bits, BS2_INVALID_INCL | BS2_NEVER_EMPTY | BS2_COMMON_STOP);
        nurdlib_map::user::clear();
    }

    #[test]
    fn register_list_exposes_a_32_element_threshold_array() {
        user_backed(0x5100);
        let block = parse_snippet("CAEN_V775(0) { address = 0x5100 time_range = 300 ns }").unwrap();
        let v775 = block.get_block("CAEN_V775").unwrap();
        let m = CaenV775Module::create(v775).unwrap();
        let threshold = m
            .register_list()
            .into_iter()
            .find(|e| e.name == "threshold")
            .unwrap();
        assert_eq!(threshold.array_length, 32);
        nurdlib_map::user::clear();
    }

    #[test]
    fn out_of_range_time_range_is_rejected() {
        user_backed(0x5200);
        let block = parse_snippet("CAEN_V775(0) { address = 0x5200 time_range = 5000 ns }").unwrap();
        let v775 = block.get_block("CAEN_V775").unwrap();
        assert!(CaenV775Module::create(v775).is_err());
        nurdlib_map::user::clear();
    }
}
