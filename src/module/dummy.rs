//! A software-only module with no hardware behind it: generates a fixed
//! per-channel data pattern on every trigger. Used for engine tests and
//! as the template new device bindings are copied from.

use log::debug;

use crate::config::{ConfigBlock, Unit};
use crate::counter::Counter;
use crate::error::{CrateError, ReadoutFail};
use crate::event_buffer::{EventBuffer, EventConstBuffer};
use crate::module::{registry, ModuleProps, ModuleSignature};
use crate::pedestal::Pedestal;

static SIGNATURE: [ModuleSignature; 1] = [ModuleSignature::new(0xffff_0000, 0xffff_0000, 0xda7a_0000)];

pub struct DummyModule {
    channels: u32,
    event_counter: u32,
    pending: bool,
}

impl DummyModule {
    fn create(block: &ConfigBlock) -> Result<Box<dyn ModuleProps>, CrateError> {
        let channels = block.get_int32("channels", Unit::None, 1, 64).unwrap_or(1) as u32;
        Ok(Box::new(Self {
            channels,
            event_counter: 0,
            pending: false,
        }))
    }
}

impl ModuleProps for DummyModule {
    fn type_name(&self) -> &'static str {
        "DUMMY"
    }

    fn check_empty(&mut self) -> ReadoutFail {
        ReadoutFail::empty()
    }

    fn get_signature(&self) -> &[ModuleSignature] {
        &SIGNATURE
    }

    fn init_slow(&mut self) -> Result<bool, CrateError> {
        Ok(true)
    }

    fn init_fast(&mut self) -> Result<(), CrateError> {
        debug!("DUMMY: {} channel(s)", self.channels);
        Ok(())
    }

    fn readout_dt(&mut self) -> ReadoutFail {
        self.pending = true;
        self.event_counter = self.event_counter.wrapping_add(1);
        ReadoutFail::empty()
    }

    fn event_counter(&self) -> Counter {
        Counter::new(self.event_counter, 0xffff_ffff)
    }

    fn readout(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail {
        if !self.pending {
            return ReadoutFail::empty();
        }
        self.pending = false;

        let mut words = Vec::with_capacity(self.channels as usize + 2);
        words.push(SIGNATURE[0].fixed_value | (self.channels & 0xffff));
        for channel in 0..self.channels {
            words.push((channel << 16) | (self.event_counter & 0xffff));
        }
        words.push(self.event_counter);

        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        if buf.write(&bytes) {
            ReadoutFail::empty()
        } else {
            ReadoutFail::DATA_TOO_MUCH
        }
    }

    fn parse_data(&mut self, mut data: EventConstBuffer<'_>, _crate_counter: Counter, pedestals: Option<&mut [Pedestal]>) -> ReadoutFail {
        if data.bytes() == 0 {
            return ReadoutFail::empty();
        }
        if data.bytes() < 8 {
            return ReadoutFail::DATA_CORRUPT;
        }
        let header = u32::from_ne_bytes(data.as_slice()[0..4].try_into().unwrap());
        if header & SIGNATURE[0].fixed_mask != SIGNATURE[0].fixed_value {
            return ReadoutFail::DATA_CORRUPT;
        }
        if let Some(pedestals) = pedestals {
            for (channel, slot) in pedestals.iter_mut().enumerate() {
                if let Some(word) = data.as_slice().get(4 + channel * 4..8 + channel * 4) {
                    let sample = u32::from_ne_bytes(word.try_into().unwrap()) & 0xffff;
                    slot.add(sample as u16);
                }
            }
        }
        data.advance(0);
        ReadoutFail::empty()
    }

    fn event_count_of(&self, data: EventConstBuffer<'_>) -> Option<u32> {
        let bytes_per_event = (self.channels as usize + 2) * 4;
        if bytes_per_event == 0 {
            return None;
        }
        Some((data.bytes() / bytes_per_event) as u32)
    }

    fn apply_config(&mut self, snippet: &ConfigBlock) -> Result<(), CrateError> {
        if let Ok(channels) = snippet.get_int32("channels", Unit::None, 1, 64) {
            self.channels = channels as u32;
        }
        Ok(())
    }
}

/// Registers this type's constructor; called once at process start by the
/// embedding application alongside every other device module it links in.
pub fn register() {
    registry::register("DUMMY", DummyModule::create);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_snippet;
    use crate::event_buffer::EventBuffer;

    #[test]
    fn readout_emits_one_word_per_channel_plus_header_and_trailer() {
        let block = parse_snippet("DUMMY(0) { channels = 3 }").unwrap();
        let dummy_block = block.get_block("DUMMY").unwrap();
        let mut m = DummyModule::create(dummy_block).unwrap();
        m.init_slow().unwrap();
        m.init_fast().unwrap();
        m.readout_dt();

        let mut store = [0u8; 64];
        let mut buf = EventBuffer::new(&mut store);
        let fail = m.readout(&mut buf);
        assert!(fail.is_empty());
        assert_eq!(buf.bytes(), 64 - 5 * 4);
    }

    #[test]
    fn readout_without_a_pending_trigger_writes_nothing() {
        let block = parse_snippet("DUMMY(0) { channels = 1 }").unwrap();
        let dummy_block = block.get_block("DUMMY").unwrap();
        let mut m = DummyModule::create(dummy_block).unwrap();
        let mut store = [0u8; 16];
        let mut buf = EventBuffer::new(&mut store);
        m.readout(&mut buf);
        assert_eq!(buf.bytes(), 16);
    }
}
