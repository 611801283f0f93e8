//! The crate-scoped readout state machine: configures an ordered module
//! list from a parsed config tree, drives init/readout/dead-time release,
//! and reconciles each module's trigger counter against its own.

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::acvt::Acvt;
use crate::config::{ConfigBlock, ConfigBlockDump};
use crate::counter::{diff, Counter};
use crate::error::{CrateError, ReadoutFail};
use crate::event_buffer::{EventBuffer, EventConstBuffer};
use crate::module::{registry, Module, ModuleProps, ModuleSignature};
use crate::pedestal::Pedestal;
use crate::tag::Tag;

/// A fixed sentinel distinguishable from any real module's first payload
/// word, emitted between adjacent modules whose signatures collide.
pub const BARRIER_WORD: u32 = 0xFACE_B00C;

/// `BARRIER`'s structural role is "force a signature break here" — it has
/// no hardware, no config, and no signature of its own, but it needs to
/// show up in the module list like any other device so enumeration and
/// declaration order see it.
struct BarrierModule;

static BARRIER_SIGNATURE: [ModuleSignature; 0] = [];

impl ModuleProps for BarrierModule {
    fn type_name(&self) -> &'static str {
        "BARRIER"
    }
    fn check_empty(&mut self) -> ReadoutFail {
        ReadoutFail::empty()
    }
    fn get_signature(&self) -> &[ModuleSignature] {
        &BARRIER_SIGNATURE
    }
    fn init_slow(&mut self) -> Result<bool, CrateError> {
        Ok(true)
    }
    fn init_fast(&mut self) -> Result<(), CrateError> {
        Ok(())
    }
    fn readout_dt(&mut self) -> ReadoutFail {
        ReadoutFail::empty()
    }
    fn readout(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail {
        if buf.write(&BARRIER_WORD.to_ne_bytes()) {
            ReadoutFail::empty()
        } else {
            ReadoutFail::DATA_TOO_MUCH
        }
    }
    fn parse_data(&mut self, _data: EventConstBuffer<'_>, _crate_counter: Counter, _pedestals: Option<&mut [Pedestal]>) -> ReadoutFail {
        ReadoutFail::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Configured,
    Initialized,
    Ready,
    Latched,
    Drained,
    TornDown,
}

const INIT_SLOW_RETRY_MAX: u32 = 5;
const INIT_SLOW_RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub struct DaqCrate {
    name: String,
    state: State,
    modules: Vec<Module>,
    tags: Vec<Tag>,
    counter: Counter,
    acvt: Acvt,
    free_running: bool,
    dt_release: Option<Box<dyn FnMut() + Send>>,
    event_max_override: u32,
    config_snapshot: Option<ConfigBlockDump>,
}

impl DaqCrate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: State::Created,
            modules: Vec::new(),
            tags: Vec::new(),
            counter: Counter::new(0, 0xffff_ffff),
            acvt: Acvt::new(0, 0, 0),
            free_running: false,
            dt_release: None,
            event_max_override: 0,
            config_snapshot: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut [Module] {
        &mut self.modules
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn dt_release_configured(&self) -> bool {
        self.dt_release.is_some()
    }

    pub fn event_max_override(&self) -> u32 {
        self.event_max_override
    }

    pub fn set_event_max_override(&mut self, event_max: u32) {
        self.event_max_override = event_max;
    }

    /// The parsed config tree this crate was built from, for the control
    /// surface's `config_dump`. `None` before `configure`.
    pub fn config_dump(&self) -> Option<&ConfigBlockDump> {
        self.config_snapshot.as_ref()
    }

    /// The crate's own trigger counter, reconciled against each module's
    /// `event_counter` at `readout_dt` time.
    pub fn counter(&self) -> Counter {
        self.counter
    }

    /// Overrides the crate counter, e.g. to bind it to an external scaler
    /// or to reset it after a run boundary. Masked to `Counter::NONE`
    /// disables reconciliation crate-wide.
    pub fn set_counter(&mut self, counter: Counter) {
        self.counter = counter;
    }

    /// Enables feeding `module_index`'s parsed samples into a `channels`-
    /// wide pedestal ring during `readout`.
    pub fn set_pedestal_channels(&mut self, module_index: usize, channels: usize) -> Result<(), CrateError> {
        let module = self.modules.get_mut(module_index).ok_or_else(|| CrateError::Identity {
            module: self.name.clone(),
            detail: format!("no such module index: {module_index}"),
        })?;
        module.pedestals = (0..channels).map(|_| Pedestal::new()).collect();
        module.do_pedestals = channels > 0;
        Ok(())
    }

    pub fn acvt(&self) -> &Acvt {
        &self.acvt
    }

    pub fn set_acvt(&mut self, initial_ns: u32, step_ns: u32, cap_ns: u32) {
        self.acvt = Acvt::new(initial_ns, step_ns, cap_ns);
    }

    pub fn set_free_running(&mut self, free_running: bool) {
        self.free_running = free_running;
    }

    pub fn set_dead_time_release(&mut self, callback: Box<dyn FnMut() + Send>) {
        self.dt_release = Some(callback);
    }

    fn require_state(&self, expected: State) -> Result<(), CrateError> {
        if self.state != expected {
            return Err(CrateError::Identity {
                module: self.name.clone(),
                detail: format!("expected state {expected:?}, found {:?}", self.state),
            });
        }
        Ok(())
    }

    /// Builds the module list (and a single default tag spanning all of
    /// them) from every child block of `crate_block`, in declaration
    /// order. `BARRIER` blocks are structural markers represented as an
    /// inert module of their own, so they show up in enumeration and in
    /// declaration order alongside real devices.
    pub fn configure(&mut self, crate_block: &ConfigBlock) -> Result<(), CrateError> {
        self.require_state(State::Created)?;
        let mut default_tag = Tag::new(0, "default", u32::MAX);
        for child in crate_block.block_children() {
            let props: Box<dyn ModuleProps> = if child.name.eq_ignore_ascii_case("BARRIER") {
                Box::new(BarrierModule)
            } else {
                registry::construct(&child.name, child)?
            };
            let index = self.modules.len();
            self.modules.push(Module::new(index, props, u32::MAX));
            default_tag.add_module(index);
        }
        self.tags.push(default_tag);
        self.config_snapshot = Some(crate_block.dump());
        self.state = State::Configured;
        Ok(())
    }

    /// `config()`: merges a config snippet into one module's live config,
    /// then re-runs that module's `deinit`/`init_fast`/`post_init`, without
    /// disturbing the rest of the crate.
    pub fn apply_module_snippet(&mut self, module_index: usize, snippet: &ConfigBlock) -> Result<(), CrateError> {
        self.require_state(State::Ready)?;
        let module = self.modules.get_mut(module_index).ok_or_else(|| CrateError::Identity {
            module: self.name.clone(),
            detail: format!("no such module index: {module_index}"),
        })?;
        module.props.apply_config(snippet)?;
        module.props.deinit();
        module.props.init_fast()?;
        module.props.post_init()?;
        Ok(())
    }

    /// `CONFIGURED -> INITIALIZED -> READY`: `init_slow` (bounded retry),
    /// then `init_fast`, then `post_init`, each across every module in
    /// declaration order.
    pub fn init(&mut self) -> Result<(), CrateError> {
        self.require_state(State::Configured)?;
        for module in &mut self.modules {
            let mut attempts = 0;
            loop {
                match module.props.init_slow() {
                    Ok(true) => break,
                    Ok(false) => {
                        attempts += 1;
                        if attempts >= INIT_SLOW_RETRY_MAX {
                            return Err(CrateError::InitRetryExhausted {
                                module: module.type_name().to_string(),
                                attempts,
                            });
                        }
                        warn!("{}: init_slow not ready, retrying ({attempts}/{INIT_SLOW_RETRY_MAX})", module.type_name());
                        thread::sleep(INIT_SLOW_RETRY_BACKOFF);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        for module in &mut self.modules {
            module.props.init_fast()?;
            module.event_counter = module.props.event_counter();
            // Diff of crate counter minus event counter, latched once at
            // init so later reconciliation only ever sees how far the two
            // have drifted apart since this moment.
            module.this_minus_crate = diff(self.counter, module.event_counter, 0);
        }
        for module in &mut self.modules {
            module.props.post_init()?;
        }
        self.state = State::Initialized;
        self.state = State::Ready;
        info!("crate {}: {} module(s) ready", self.name, self.modules.len());
        Ok(())
    }

    /// Re-configuration only re-runs `deinit` then `init_fast`/`post_init`
    /// — `init_slow` stays put, since it covers steps painful to repeat
    /// (bus mapping, firmware probes).
    pub fn reconfigure(&mut self) -> Result<(), CrateError> {
        self.require_state(State::Ready)?;
        for module in &mut self.modules {
            module.props.deinit();
        }
        for module in &mut self.modules {
            module.props.init_fast()?;
        }
        for module in &mut self.modules {
            module.props.post_init()?;
        }
        Ok(())
    }

    /// `READY -> LATCHED`: latches every non-`skip_dt` module in
    /// declaration order, releasing dead-time once done (unless
    /// free-running). ACVT grows when an early-DT module signals it had
    /// to wait, by OR-ing `DATA_MISSING` into its own readout_dt result —
    /// the crate can't see inside the module, so growth is driven purely
    /// by that bit being set on an `EARLY_DT` module.
    pub fn readout_dt(&mut self) -> Result<ReadoutFail, CrateError> {
        self.require_state(State::Ready)?;
        if self.counter.has_counter() {
            self.counter.value = self.counter.value.wrapping_add(1);
        }
        let mut fail = ReadoutFail::empty();
        let mut any_had_to_wait = false;
        for module in &mut self.modules {
            if module.skip_dt {
                continue;
            }
            let f = module.props.readout_dt();
            module.result |= f;
            fail |= f;
            if module.is_early_dt() && f.contains(ReadoutFail::DATA_MISSING) {
                any_had_to_wait = true;
            }

            module.event_counter = module.props.event_counter();
            if module.event_counter.has_counter() && module.counter_diff(self.counter) != 0 {
                module.result |= ReadoutFail::EVENT_COUNTER_MISMATCH;
                fail |= ReadoutFail::EVENT_COUNTER_MISMATCH;
            }
        }
        if any_had_to_wait && self.acvt.grow() {
            let new_ns = self.acvt.get_ns();
            debug!("crate {}: ACVT grew to {new_ns} ns", self.name);
            for module in &mut self.modules {
                module.props.cvt_set(new_ns);
            }
        }
        if !self.free_running {
            if let Some(cb) = &mut self.dt_release {
                cb();
            }
        }
        self.state = State::Latched;
        Ok(fail)
    }

    /// `LATCHED -> DRAINED`: drains every module in `tag_id`, in
    /// declaration order, inserting a [`BARRIER_WORD`] between adjacent
    /// modules whose signatures collide.
    pub fn readout(&mut self, tag_id: u32, out: &mut EventBuffer<'_>) -> Result<ReadoutFail, CrateError> {
        self.require_state(State::Latched)?;
        let tag = self
            .tags
            .iter()
            .find(|t| t.id == tag_id)
            .ok_or_else(|| CrateError::Identity {
                module: self.name.clone(),
                detail: format!("no such tag: {tag_id}"),
            })?
            .modules()
            .to_vec();

        let expected = self.event_diff(tag_id);
        let mut fail = ReadoutFail::empty();
        let mut prev_signature: Option<Vec<ModuleSignature>> = None;
        for &index in &tag {
            let module = &mut self.modules[index];
            let signature = module.props.get_signature().to_vec();
            if let Some(prev) = &prev_signature {
                if ModuleSignature::collides(prev, &signature) {
                    if !out.write(&BARRIER_WORD.to_ne_bytes()) {
                        fail |= ReadoutFail::DATA_TOO_MUCH;
                    }
                }
            }
            let mark = out.mark();
            let f = module.props.readout(out);
            module.result |= f;
            fail |= f;

            let check = module.props.check_empty();
            if !check.is_empty() {
                fail |= check;
                module.result |= check;
            }

            let region = out.written_since(mark);
            if let Some(expected) = expected {
                if let Some(produced) = module.props.event_count_of(region) {
                    let mismatch = if produced < expected {
                        Some(ReadoutFail::DATA_MISSING)
                    } else if produced > expected {
                        Some(ReadoutFail::DATA_TOO_MUCH)
                    } else {
                        None
                    };
                    if let Some(bit) = mismatch {
                        fail |= bit;
                        module.result |= bit;
                    }
                }
            }

            let pedestals = if module.do_pedestals {
                Some(module.pedestals.as_mut_slice())
            } else {
                None
            };
            let parsed = module.props.parse_data(region, self.counter, pedestals);
            if !parsed.is_empty() {
                fail |= parsed;
                module.result |= parsed;
            }

            prev_signature = Some(signature);
        }
        self.state = State::Drained;
        Ok(fail)
    }

    /// `DRAINED -> READY`: snapshots each module's previous counter value
    /// and clears per-event accumulators.
    pub fn readout_finalize(&mut self) -> Result<(), CrateError> {
        self.require_state(State::Drained)?;
        for module in &mut self.modules {
            module.crate_counter_prev = self.counter;
            module.result = ReadoutFail::empty();
            if module.do_pedestals {
                for p in &mut module.pedestals {
                    p.calculate();
                }
                module.props.use_pedestals(&module.pedestals);
            }
        }
        self.state = State::Ready;
        Ok(())
    }

    /// The dead-time-latched trigger count for `tag_id`: the minimum
    /// per-module counter diff against the crate counter, clamped to the
    /// tag's `event_max`.
    pub fn event_diff(&self, tag_id: u32) -> Option<u32> {
        let tag = self.tags.iter().find(|t| t.id == tag_id)?;
        let min = tag
            .modules()
            .iter()
            .filter_map(|&i| {
                let m = &self.modules[i];
                m.event_counter.has_counter().then(|| m.counter_diff(self.counter))
            })
            .min()
            .unwrap_or(0);
        Some(min.min(tag.event_max))
    }

    pub fn deinit(&mut self) {
        for module in self.modules.iter_mut().rev() {
            module.props.deinit();
            module.props.destroy();
        }
        self.state = State::TornDown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_snippet;
    use crate::event_buffer::EventConstBuffer;
    use crate::module::{registry, ModuleProps};

    struct StubModule {
        signature: Vec<ModuleSignature>,
        data: Vec<u8>,
    }

    impl ModuleProps for StubModule {
        fn type_name(&self) -> &'static str {
            "STUB"
        }
        fn check_empty(&mut self) -> ReadoutFail {
            ReadoutFail::empty()
        }
        fn get_signature(&self) -> &[ModuleSignature] {
            &self.signature
        }
        fn init_slow(&mut self) -> Result<bool, CrateError> {
            Ok(true)
        }
        fn init_fast(&mut self) -> Result<(), CrateError> {
            Ok(())
        }
        fn readout_dt(&mut self) -> ReadoutFail {
            ReadoutFail::empty()
        }
        fn readout(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail {
            if buf.write(&self.data) {
                ReadoutFail::empty()
            } else {
                ReadoutFail::DATA_TOO_MUCH
            }
        }
        fn parse_data(&mut self, _data: EventConstBuffer<'_>, _crate_counter: Counter, _pedestals: Option<&mut [Pedestal]>) -> ReadoutFail {
            ReadoutFail::empty()
        }
    }

    fn stub_factory(_block: &ConfigBlock) -> Result<Box<dyn ModuleProps>, CrateError> {
        Ok(Box::new(StubModule {
            signature: vec![ModuleSignature::new(0xff00_0000, 0xff00_0000, 0x1000_0000)],
            data: vec![0xaa, 0xbb, 0xcc, 0xdd],
        }))
    }

    fn other_stub_factory(_block: &ConfigBlock) -> Result<Box<dyn ModuleProps>, CrateError> {
        Ok(Box::new(StubModule {
            signature: vec![ModuleSignature::new(0xff00_0000, 0xff00_0000, 0x2000_0000)],
            data: vec![0x11, 0x22, 0x33, 0x44],
        }))
    }

    #[test]
    fn empty_crate_enumerates_with_no_modules() {
        let block = parse_snippet("CRATE(\"AyeBeEmpty\") { }").unwrap();
        let crate_block = block.get_block("CRATE").unwrap();
        let mut c = DaqCrate::new(crate_block.param_string(0).unwrap());
        c.configure(crate_block).unwrap();
        assert_eq!(c.name(), "AyeBeEmpty");
        assert!(c.modules().is_empty());
    }

    #[test]
    fn full_cycle_drains_modules_in_declaration_order() {
        registry::clear();
        registry::register("STUB_A", stub_factory);
        registry::register("STUB_B", other_stub_factory);
        let block = parse_snippet("CRATE(\"Simple\") { STUB_A(0){} STUB_B(0){} }").unwrap();
        let crate_block = block.get_block("CRATE").unwrap();

        let mut c = DaqCrate::new("Simple");
        c.configure(crate_block).unwrap();
        c.init().unwrap();
        assert_eq!(c.state(), State::Ready);

        c.readout_dt().unwrap();
        assert_eq!(c.state(), State::Latched);

        let mut store = [0u8; 64];
        let mut eb = EventBuffer::new(&mut store);
        let fail = c.readout(0, &mut eb).unwrap();
        assert!(fail.is_empty());
        assert_eq!(c.state(), State::Drained);

        c.readout_finalize().unwrap();
        assert_eq!(c.state(), State::Ready);

        assert_eq!(&store[0..4], &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(&store[4..8], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn barrier_children_enumerate_as_modules() {
        registry::clear();
        registry::register("STUB_A", stub_factory);
        registry::register("STUB_B", other_stub_factory);
        let block = parse_snippet("CRATE(\"Simple\") { STUB_A(0){} BARRIER{} STUB_B(0){} }").unwrap();
        let crate_block = block.get_block("CRATE").unwrap();

        let mut c = DaqCrate::new("Simple");
        c.configure(crate_block).unwrap();
        let names: Vec<&str> = c.modules().iter().map(Module::type_name).collect();
        assert_eq!(names, ["STUB", "BARRIER", "STUB"]);
    }

    struct CountingModule {
        signature: Vec<ModuleSignature>,
        counter: u32,
    }

    impl ModuleProps for CountingModule {
        fn type_name(&self) -> &'static str {
            "COUNTING"
        }
        fn check_empty(&mut self) -> ReadoutFail {
            ReadoutFail::empty()
        }
        fn get_signature(&self) -> &[ModuleSignature] {
            &self.signature
        }
        fn init_slow(&mut self) -> Result<bool, CrateError> {
            Ok(true)
        }
        fn init_fast(&mut self) -> Result<(), CrateError> {
            Ok(())
        }
        fn readout_dt(&mut self) -> ReadoutFail {
            self.counter = self.counter.wrapping_add(1);
            ReadoutFail::empty()
        }
        fn event_counter(&self) -> Counter {
            Counter::new(self.counter, 0xffff_ffff)
        }
        fn readout(&mut self, buf: &mut EventBuffer<'_>) -> ReadoutFail {
            if buf.write(&[0xee]) {
                ReadoutFail::empty()
            } else {
                ReadoutFail::DATA_TOO_MUCH
            }
        }
        fn parse_data(&mut self, _data: EventConstBuffer<'_>, _crate_counter: Counter, _pedestals: Option<&mut [Pedestal]>) -> ReadoutFail {
            ReadoutFail::empty()
        }
    }

    fn counting_factory(_block: &ConfigBlock) -> Result<Box<dyn ModuleProps>, CrateError> {
        Ok(Box::new(CountingModule {
            signature: vec![ModuleSignature::new(0xff00_0000, 0xff00_0000, 0x3000_0000)],
            counter: 0,
        }))
    }

    #[test]
    fn module_counter_in_lockstep_with_crate_raises_no_mismatch() {
        registry::clear();
        registry::register("COUNTING", counting_factory);
        let block = parse_snippet("CRATE(\"Lockstep\") { COUNTING(0){} }").unwrap();
        let crate_block = block.get_block("CRATE").unwrap();

        let mut c = DaqCrate::new("Lockstep");
        c.configure(crate_block).unwrap();
        c.init().unwrap();

        for _ in 0..3 {
            let fail = c.readout_dt().unwrap();
            assert!(!fail.contains(ReadoutFail::EVENT_COUNTER_MISMATCH));
            let mut store = [0u8; 16];
            let mut eb = EventBuffer::new(&mut store);
            c.readout(0, &mut eb).unwrap();
            c.readout_finalize().unwrap();
        }
    }

    #[test]
    fn module_counter_falling_behind_raises_mismatch() {
        registry::clear();
        registry::register("COUNTING", counting_factory);
        let block = parse_snippet("CRATE(\"Skipping\") { COUNTING(0){} }").unwrap();
        let crate_block = block.get_block("CRATE").unwrap();

        let mut c = DaqCrate::new("Skipping");
        c.configure(crate_block).unwrap();
        c.init().unwrap();

        // Skip this module's own dead-time latch once so its counter falls
        // behind the crate's, then expect the next readout_dt to flag it.
        c.modules_mut()[0].skip_dt = true;
        c.readout_dt().unwrap();
        let mut store = [0u8; 16];
        let mut eb = EventBuffer::new(&mut store);
        c.readout(0, &mut eb).unwrap();
        c.readout_finalize().unwrap();

        c.modules_mut()[0].skip_dt = false;
        let fail = c.readout_dt().unwrap();
        assert!(fail.contains(ReadoutFail::EVENT_COUNTER_MISMATCH));
    }

    #[test]
    fn apply_module_snippet_merges_config_before_reinitializing() {
        registry::clear();
        crate::module::dummy::register();
        let block = parse_snippet("CRATE(\"Reconf\") { DUMMY(0) { channels = 1 } }").unwrap();
        let crate_block = block.get_block("CRATE").unwrap();

        let mut c = DaqCrate::new("Reconf");
        c.configure(crate_block).unwrap();
        c.init().unwrap();

        let snippet = parse_snippet("channels = 4").unwrap();
        c.apply_module_snippet(0, &snippet).unwrap();

        c.readout_dt().unwrap();
        let mut store = [0u8; 64];
        let mut eb = EventBuffer::new(&mut store);
        c.readout(0, &mut eb).unwrap();
        // 4 channels + header + trailer = 6 words = 24 bytes.
        assert_eq!(eb.bytes(), 64 - 24);
    }
}
