use anyhow::Result;
use nurdlib::config::parse_snippet;
use nurdlib::{register_builtin_modules, DaqCrate, EventBuffer};

pub fn main() -> Result<()> {
    env_logger::init();

    register_builtin_modules();

    let root = parse_snippet("CRATE(\"Demo\") { DUMMY(0) { channels = 4 } }")?;
    let crate_block = root.get_block("CRATE").expect("CRATE block");

    let mut daq = DaqCrate::new(crate_block.param_string(0)?);
    daq.configure(crate_block)?;
    daq.init()?;
    log::info!("crate {} ready with {} module(s)", daq.name(), daq.modules().len());

    for event in 0..5 {
        daq.readout_dt()?;

        let mut store = [0u8; 256];
        let mut buf = EventBuffer::new(&mut store);
        let fail = daq.readout(0, &mut buf)?;
        if !fail.is_empty() {
            log::warn!("event {event}: readout fail bits {fail:?}");
        }
        daq.readout_finalize()?;
        println!("event {event}: {} bytes drained", 256 - buf.bytes());
    }

    daq.deinit();
    Ok(())
}
