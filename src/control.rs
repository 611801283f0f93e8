//! Remote introspection of live crates: enumerate, dump live config, read
//! documented registers, merge a config snippet, and pass through to a
//! serial-fibre protocol controller — plus the length-delimited TLV socket
//! server that exposes all of it to an operator console (§6.3).

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info, warn};

use crate::config::{parse_snippet, ConfigBlockDump, ConfigDump};
use crate::daq_crate::DaqCrate;
use crate::error::CrateError;
use crate::module::RegisterListEntry;

/// The operator console's default control port; overridable by the
/// embedding application.
pub const DEFAULT_PORT: u16 = 5700;

#[derive(Debug, Clone)]
pub struct ModuleSummary {
    pub type_name: String,
    pub submodules: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CrateSummary {
    pub name: String,
    pub modules: Vec<ModuleSummary>,
}

#[derive(Debug, Clone, Copy)]
pub struct CrateInfo {
    pub event_max_override: u32,
    pub dt_release_bool: bool,
    pub acvt_ns: u32,
    pub shadow_buf_bytes: usize,
    pub shadow_max_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RegisterValue {
    pub name: String,
    pub address: u32,
    pub values: Vec<u32>,
}

/// Pass-through to the serial-fibre protocol controller, when one is
/// attached to the crate — mirrors the bus mapping layer's single-cycle
/// read/write shape but addresses a controller card rather than a module.
pub trait GocController: Send {
    fn read(&mut self, sfp: u32, card: u32, offset: u32, num: u32) -> Result<Vec<u32>, CrateError>;
    fn write(&mut self, sfp: u32, card: u32, offset: u32, values: &[u32]) -> Result<(), CrateError>;
}

fn no_such_crate(ci: usize) -> CrateError {
    CrateError::Identity {
        module: "control".into(),
        detail: format!("no such crate index: {ci}"),
    }
}

fn no_such_module(ci: usize, mi: usize) -> CrateError {
    CrateError::Identity {
        module: "control".into(),
        detail: format!("crate {ci} has no module index {mi}"),
    }
}

/// Owns every crate a single process serves over the control surface, plus
/// an optional serial-fibre controller shared across all of them.
pub struct ControlSurface {
    crates: Vec<Mutex<DaqCrate>>,
    goc: Option<Mutex<Box<dyn GocController>>>,
}

impl ControlSurface {
    pub fn new(crates: Vec<DaqCrate>) -> Self {
        Self {
            crates: crates.into_iter().map(Mutex::new).collect(),
            goc: None,
        }
    }

    pub fn set_goc_controller(&mut self, controller: Box<dyn GocController>) {
        self.goc = Some(Mutex::new(controller));
    }

    pub fn crate_array_get(&self) -> Vec<CrateSummary> {
        self.crates
            .iter()
            .map(|c| {
                let c = c.lock().unwrap();
                CrateSummary {
                    name: c.name().to_string(),
                    modules: c
                        .modules()
                        .iter()
                        .map(|m| ModuleSummary {
                            type_name: m.type_name().to_string(),
                            submodules: m.props.sub_modules().iter().map(|s| s.to_string()).collect(),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    pub fn crate_info_get(&self, ci: usize) -> Result<CrateInfo, CrateError> {
        let guard = self.crates.get(ci).ok_or_else(|| no_such_crate(ci))?.lock().unwrap();
        let (shadow_buf_bytes, shadow_max_bytes) = guard.modules().iter().filter_map(|m| m.shadow.as_ref()).fold(
            (0usize, 0usize),
            |(buf, max), shadow| {
                let cap = shadow.lock().unwrap().capacity();
                (buf + cap, max + cap)
            },
        );
        Ok(CrateInfo {
            event_max_override: guard.event_max_override(),
            dt_release_bool: guard.dt_release_configured(),
            acvt_ns: guard.acvt().get_ns(),
            shadow_buf_bytes,
            shadow_max_bytes,
        })
    }

    pub fn config_dump(&self, ci: usize) -> Result<ConfigBlockDump, CrateError> {
        let guard = self.crates.get(ci).ok_or_else(|| no_such_crate(ci))?.lock().unwrap();
        guard.config_dump().cloned().ok_or_else(|| CrateError::Identity {
            module: guard.name().to_string(),
            detail: "crate has not been configured yet".into(),
        })
    }

    pub fn register_array_get(&self, ci: usize, mi: usize, smi: Option<usize>) -> Result<Vec<RegisterValue>, CrateError> {
        let mut guard = self.crates.get(ci).ok_or_else(|| no_such_crate(ci))?.lock().unwrap();
        let module = guard.modules_mut().get_mut(mi).ok_or_else(|| no_such_module(ci, mi))?;
        if let Some(smi) = smi {
            if smi >= module.props.sub_modules().len() {
                return Err(no_such_module(ci, mi));
            }
        }
        let list: Vec<RegisterListEntry> = module.props.register_list();
        let mut out = Vec::with_capacity(list.len());
        for entry in list {
            let step = (entry.bits as u32 / 8).max(1);
            let count = entry.array_length.max(1);
            let mut values = Vec::with_capacity(count as usize);
            for i in 0..count {
                values.push(module.props.register_read(entry.address + i * step, entry.bits)?);
            }
            out.push(RegisterValue {
                name: entry.name,
                address: entry.address,
                values,
            });
        }
        Ok(out)
    }

    /// `config(ci, mi, snippet)`: parses `snippet` and merges it into
    /// module `mi`'s live config, then re-runs that module's
    /// `deinit`/`init_fast`/`post_init`.
    pub fn config_apply(&self, ci: usize, mi: usize, snippet: &str) -> Result<(), CrateError> {
        let block = parse_snippet(snippet)?;
        let mut guard = self.crates.get(ci).ok_or_else(|| no_such_crate(ci))?.lock().unwrap();
        guard.apply_module_snippet(mi, &block)
    }

    pub fn goc_read(&self, sfp: u32, card: u32, offset: u32, num: u32) -> Result<Vec<u32>, CrateError> {
        let mut goc = self
            .goc
            .as_ref()
            .ok_or_else(|| CrateError::Identity {
                module: "goc".into(),
                detail: "no serial-fibre controller attached".into(),
            })?
            .lock()
            .unwrap();
        goc.read(sfp, card, offset, num)
    }

    pub fn goc_write(&self, sfp: u32, card: u32, offset: u32, values: &[u32]) -> Result<(), CrateError> {
        let mut goc = self
            .goc
            .as_ref()
            .ok_or_else(|| CrateError::Identity {
                module: "goc".into(),
                detail: "no serial-fibre controller attached".into(),
            })?
            .lock()
            .unwrap();
        goc.write(sfp, card, offset, values)
    }
}

fn render_crate_array(list: &[CrateSummary]) -> String {
    list.iter()
        .map(|c| {
            let modules = c
                .modules
                .iter()
                .map(|m| {
                    if m.submodules.is_empty() {
                        m.type_name.clone()
                    } else {
                        format!("{}[{}]", m.type_name, m.submodules.join(","))
                    }
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{}:[{modules}]", c.name)
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn render_config_dump(dump: &ConfigBlockDump) -> String {
    let params = dump
        .params
        .iter()
        .map(|p| format!("{:?}", p.value))
        .collect::<Vec<_>>()
        .join(",");
    let children = dump
        .children
        .iter()
        .map(|c| match c {
            ConfigDump::Scalar { key, values } => {
                format!("{key}={}", values.iter().map(|s| format!("{:?}", s.value)).collect::<Vec<_>>().join(","))
            }
            ConfigDump::Block(b) => render_config_dump(b),
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("{}({params}){{{children}}}", dump.name)
}

fn render_register_values(values: &[RegisterValue]) -> String {
    values
        .iter()
        .map(|v| format!("{}@0x{:x}=[{}]", v.name, v.address, v.values.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(",")))
        .collect::<Vec<_>>()
        .join(";")
}

// ---------------------------------------------------------------------
// Wire protocol (§6.3): length-delimited datagrams carrying typed TLV
// fields. Field types are the scalars the spec names (u8/u16/u32/u64,
// zero-terminated string, source-location triple); the bulk list/dump/
// register payloads are rendered into one such string each, rather than
// inventing a nested field type the spec doesn't define.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Str(String),
    SourceLoc { path: String, line: u32, col: u32 },
}

const TAG_U8: u8 = 1;
const TAG_U16: u8 = 2;
const TAG_U32: u8 = 3;
const TAG_U64: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_SOURCE_LOC: u8 = 6;

fn tlv_err(message: impl Into<String>) -> CrateError {
    CrateError::Config {
        key: "control".into(),
        message: message.into(),
        path: "<wire>".into(),
        line: 0,
    }
}

impl Field {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Field::U8(v) => {
                out.push(TAG_U8);
                out.extend_from_slice(&1u32.to_be_bytes());
                out.push(*v);
            }
            Field::U16(v) => {
                out.push(TAG_U16);
                out.extend_from_slice(&2u32.to_be_bytes());
                out.extend_from_slice(&v.to_be_bytes());
            }
            Field::U32(v) => {
                out.push(TAG_U32);
                out.extend_from_slice(&4u32.to_be_bytes());
                out.extend_from_slice(&v.to_be_bytes());
            }
            Field::U64(v) => {
                out.push(TAG_U64);
                out.extend_from_slice(&8u32.to_be_bytes());
                out.extend_from_slice(&v.to_be_bytes());
            }
            Field::Str(s) => {
                out.push(TAG_STR);
                out.extend_from_slice(&((s.len() + 1) as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Field::SourceLoc { path, line, col } => {
                let mut payload = Vec::with_capacity(path.len() + 9);
                payload.extend_from_slice(path.as_bytes());
                payload.push(0);
                payload.extend_from_slice(&line.to_be_bytes());
                payload.extend_from_slice(&col.to_be_bytes());
                out.push(TAG_SOURCE_LOC);
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(&payload);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<(Field, &[u8]), CrateError> {
        if buf.len() < 5 {
            return Err(tlv_err("truncated field header"));
        }
        let tag = buf[0];
        let len = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
        let rest = &buf[5..];
        if rest.len() < len {
            return Err(tlv_err("truncated field value"));
        }
        let (value, tail) = rest.split_at(len);
        let field = match tag {
            TAG_U8 => Field::U8(*value.first().ok_or_else(|| tlv_err("short u8"))?),
            TAG_U16 => Field::U16(u16::from_be_bytes(value.try_into().map_err(|_| tlv_err("short u16"))?)),
            TAG_U32 => Field::U32(u32::from_be_bytes(value.try_into().map_err(|_| tlv_err("short u32"))?)),
            TAG_U64 => Field::U64(u64::from_be_bytes(value.try_into().map_err(|_| tlv_err("short u64"))?)),
            TAG_STR => {
                let s = value.split_last().map(|(_, head)| head).unwrap_or(value);
                Field::Str(String::from_utf8_lossy(s).into_owned())
            }
            TAG_SOURCE_LOC => {
                let nul = value
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| tlv_err("source-location missing path terminator"))?;
                let path = String::from_utf8_lossy(&value[..nul]).into_owned();
                let tail_fields = &value[nul + 1..];
                if tail_fields.len() != 8 {
                    return Err(tlv_err("source-location malformed"));
                }
                let line = u32::from_be_bytes(tail_fields[0..4].try_into().unwrap());
                let col = u32::from_be_bytes(tail_fields[4..8].try_into().unwrap());
                Field::SourceLoc { path, line, col }
            }
            other => return Err(tlv_err(format!("unknown field tag {other}"))),
        };
        Ok((field, tail))
    }
}

fn encode_fields(fields: &[Field]) -> Vec<u8> {
    let mut buf = Vec::new();
    for f in fields {
        f.encode(&mut buf);
    }
    buf
}

fn decode_fields(mut buf: &[u8]) -> Result<Vec<Field>, CrateError> {
    let mut fields = Vec::new();
    while !buf.is_empty() {
        let (field, rest) = Field::decode(buf)?;
        fields.push(field);
        buf = rest;
    }
    Ok(fields)
}

fn read_datagram(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn write_datagram(stream: &mut TcpStream, status: u8, fields: &[Field]) -> io::Result<()> {
    let payload = encode_fields(fields);
    stream.write_all(&(payload.len() as u32 + 1).to_be_bytes())?;
    stream.write_all(&[status])?;
    stream.write_all(&payload)?;
    stream.flush()
}

const OP_CRATE_ARRAY_GET: u8 = 1;
const OP_CRATE_INFO_GET: u8 = 2;
const OP_CONFIG_DUMP: u8 = 3;
const OP_REGISTER_ARRAY_GET: u8 = 4;
const OP_CONFIG_APPLY: u8 = 5;
const OP_GOC_READ: u8 = 6;
const OP_GOC_WRITE: u8 = 7;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

fn field_u32(fields: &[Field], idx: usize) -> Result<u32, CrateError> {
    match fields.get(idx) {
        Some(Field::U32(v)) => Ok(*v),
        Some(Field::U16(v)) => Ok(*v as u32),
        Some(Field::U8(v)) => Ok(*v as u32),
        _ => Err(tlv_err(format!("expected an integer field at position {idx}"))),
    }
}

fn field_str<'a>(fields: &'a [Field], idx: usize) -> Result<&'a str, CrateError> {
    match fields.get(idx) {
        Some(Field::Str(s)) => Ok(s.as_str()),
        _ => Err(tlv_err(format!("expected a string field at position {idx}"))),
    }
}

fn dispatch(surface: &ControlSurface, fields: &[Field]) -> Result<Vec<Field>, CrateError> {
    let op = match fields.first() {
        Some(Field::U8(op)) => *op,
        _ => return Err(tlv_err("request is missing its opcode")),
    };
    match op {
        OP_CRATE_ARRAY_GET => Ok(vec![Field::Str(render_crate_array(&surface.crate_array_get()))]),
        OP_CRATE_INFO_GET => {
            let ci = field_u32(fields, 1)? as usize;
            let info = surface.crate_info_get(ci)?;
            Ok(vec![
                Field::U32(info.event_max_override),
                Field::U8(info.dt_release_bool as u8),
                Field::U32(info.acvt_ns),
                Field::U64(info.shadow_buf_bytes as u64),
                Field::U64(info.shadow_max_bytes as u64),
            ])
        }
        OP_CONFIG_DUMP => {
            let ci = field_u32(fields, 1)? as usize;
            let dump = surface.config_dump(ci)?;
            Ok(vec![Field::Str(render_config_dump(&dump))])
        }
        OP_REGISTER_ARRAY_GET => {
            let ci = field_u32(fields, 1)? as usize;
            let mi = field_u32(fields, 2)? as usize;
            let smi = match fields.get(3) {
                Some(Field::U32(v)) => Some(*v as usize),
                _ => None,
            };
            let values = surface.register_array_get(ci, mi, smi)?;
            Ok(vec![Field::Str(render_register_values(&values))])
        }
        OP_CONFIG_APPLY => {
            let ci = field_u32(fields, 1)? as usize;
            let mi = field_u32(fields, 2)? as usize;
            let snippet = field_str(fields, 3)?;
            surface.config_apply(ci, mi, snippet)?;
            Ok(Vec::new())
        }
        OP_GOC_READ => {
            let sfp = field_u32(fields, 1)?;
            let card = field_u32(fields, 2)?;
            let offset = field_u32(fields, 3)?;
            let num = field_u32(fields, 4)?;
            let values = surface.goc_read(sfp, card, offset, num)?;
            Ok(values.into_iter().map(Field::U32).collect())
        }
        OP_GOC_WRITE => {
            let sfp = field_u32(fields, 1)?;
            let card = field_u32(fields, 2)?;
            let offset = field_u32(fields, 3)?;
            let values: Vec<u32> = fields[4..]
                .iter()
                .map(|f| match f {
                    Field::U32(v) => Ok(*v),
                    _ => Err(tlv_err("goc write values must be u32 fields")),
                })
                .collect::<Result<_, _>>()?;
            surface.goc_write(sfp, card, offset, &values)?;
            Ok(Vec::new())
        }
        other => Err(tlv_err(format!("unknown opcode {other}"))),
    }
}

fn handle_connection(surface: &ControlSurface, mut stream: TcpStream) {
    loop {
        let payload = match read_datagram(&mut stream) {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                warn!("control connection read error: {e}");
                return;
            }
        };
        let response = decode_fields(&payload).and_then(|fields| dispatch(surface, &fields));
        let write_result = match response {
            Ok(fields) => write_datagram(&mut stream, STATUS_OK, &fields),
            Err(e) => write_datagram(&mut stream, STATUS_ERROR, &[Field::Str(e.to_string())]),
        };
        if let Err(e) = write_result {
            warn!("control connection write error: {e}");
            return;
        }
    }
}

/// Binds to `addr` and serves the control protocol until the process
/// exits; each connection is handled on its own thread and serialized
/// against the others only by each crate's own mutex.
pub fn serve(surface: Arc<ControlSurface>, addr: impl ToSocketAddrs) -> io::Result<thread::JoinHandle<()>> {
    let listener = TcpListener::bind(addr)?;
    info!("control surface listening on {:?}", listener.local_addr());
    Ok(thread::spawn(move || {
        for incoming in listener.incoming() {
            match incoming {
                Ok(stream) => {
                    let surface = Arc::clone(&surface);
                    thread::spawn(move || handle_connection(&surface, stream));
                }
                Err(e) => error!("control surface accept error: {e}"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBlock;
    use crate::counter::Counter;
    use crate::error::ReadoutFail;
    use crate::event_buffer::{EventBuffer, EventConstBuffer};
    use crate::module::{registry, ModuleProps, ModuleSignature};

    struct StubModule;

    impl ModuleProps for StubModule {
        fn type_name(&self) -> &'static str {
            "STUB"
        }
        fn check_empty(&mut self) -> ReadoutFail {
            ReadoutFail::empty()
        }
        fn get_signature(&self) -> &[ModuleSignature] {
            &[]
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
        fn readout(&mut self, _buf: &mut EventBuffer<'_>) -> ReadoutFail {
            ReadoutFail::empty()
        }
        fn parse_data(&mut self, _data: EventConstBuffer<'_>, _crate_counter: Counter, _pedestals: Option<&mut [crate::pedestal::Pedestal]>) -> ReadoutFail {
            ReadoutFail::empty()
        }
        fn register_list(&self) -> Vec<RegisterListEntry> {
            vec![RegisterListEntry {
                name: "threshold".into(),
                address: 0x40,
                bits: 16,
                array_length: 2,
            }]
        }
        fn register_read(&mut self, address: u32, _bits: u8) -> Result<u32, CrateError> {
            Ok(address)
        }
    }

    fn stub_factory(_block: &ConfigBlock) -> Result<Box<dyn ModuleProps>, CrateError> {
        Ok(Box::new(StubModule))
    }

    fn one_crate_surface() -> ControlSurface {
        registry::clear();
        registry::register("STUB", stub_factory);
        let block = crate::config::parse_snippet("CRATE(\"Console\") { STUB(0){} }").unwrap();
        let crate_block = block.get_block("CRATE").unwrap();
        let mut c = DaqCrate::new("Console");
        c.configure(crate_block).unwrap();
        c.init().unwrap();
        ControlSurface::new(vec![c])
    }

    #[test]
    fn tlv_roundtrips_every_field_kind() {
        let fields = vec![
            Field::U8(7),
            Field::U16(1000),
            Field::U32(1_000_000),
            Field::U64(1 << 40),
            Field::Str("hello".into()),
            Field::SourceLoc {
                path: "crate.cfg".into(),
                line: 12,
                col: 3,
            },
        ];
        let encoded = encode_fields(&fields);
        let decoded = decode_fields(&encoded).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn crate_array_get_reports_the_configured_module() {
        let surface = one_crate_surface();
        let summary = surface.crate_array_get();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].name, "Console");
        assert_eq!(summary[0].modules[0].type_name, "STUB");
    }

    #[test]
    fn register_array_get_reads_every_array_element() {
        let surface = one_crate_surface();
        let values = surface.register_array_get(0, 0, None).unwrap();
        assert_eq!(values[0].name, "threshold");
        assert_eq!(values[0].values, vec![0x40, 0x42]);
    }

    #[test]
    fn unknown_crate_index_is_an_error() {
        let surface = one_crate_surface();
        assert!(surface.crate_info_get(5).is_err());
    }

    #[test]
    fn dispatch_serves_a_crate_array_get_request() {
        let surface = one_crate_surface();
        let response = dispatch(&surface, &[Field::U8(OP_CRATE_ARRAY_GET)]).unwrap();
        match &response[0] {
            Field::Str(s) => assert!(s.contains("Console")),
            _ => panic!("expected a string field"),
        }
    }

    #[test]
    fn server_accepts_a_real_connection_and_round_trips_a_request() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let surface = Arc::new(one_crate_surface());
        let accept_surface = Arc::clone(&surface);
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                handle_connection(&accept_surface, stream);
            }
        });

        let mut client = TcpStream::connect(addr).unwrap();
        write_datagram_from_client(&mut client, &[Field::U8(OP_CRATE_ARRAY_GET)]);
        let payload = read_datagram(&mut client).unwrap().unwrap();
        assert_eq!(payload[0], STATUS_OK);
        let fields = decode_fields(&payload[1..]).unwrap();
        match &fields[0] {
            Field::Str(s) => assert!(s.contains("Console")),
            _ => panic!("expected a string field"),
        }
    }

    fn write_datagram_from_client(stream: &mut TcpStream, fields: &[Field]) {
        let payload = encode_fields(fields);
        stream.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
        stream.write_all(&payload).unwrap();
        stream.flush().unwrap();
    }
}
