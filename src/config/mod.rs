//! The declarative configuration language (§6.1): a line-oriented text
//! format of `KEY = value[, value]*` assignments and `KEY(params) { ... }`
//! blocks, parsed into a [`ConfigBlock`] tree with unit- and range-checked
//! accessors.

mod block;
mod lexer;
mod parser;
mod unit;

pub use block::{ConfigBlock, ConfigBlockDump, ConfigDump, ScalarValue, Source};
pub use parser::{parse_snippet, SNIPPET_MAX_BYTES};
pub use unit::Unit;

use std::path::{Path, PathBuf};

use crate::error::CrateError;

/// Owns a parsed config tree plus the include search path it was loaded
/// with. The root block has no name and no params; `root()` is what the
/// C API calls passing `NULL` as the block.
pub struct Config {
    root: ConfigBlock,
    default_path: Option<PathBuf>,
}

impl Config {
    /// Parses `path` and every file it (transitively) includes.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CrateError> {
        Self::load_with_default_path(path, None)
    }

    pub fn load_with_default_path(
        path: impl AsRef<Path>,
        default_path: Option<&Path>,
    ) -> Result<Self, CrateError> {
        let root = parser::load(path, default_path)?;
        Ok(Self {
            root,
            default_path: default_path.map(Path::to_path_buf),
        })
    }

    pub fn root(&self) -> &ConfigBlock {
        &self.root
    }

    pub fn default_path(&self) -> Option<&Path> {
        self.default_path.as_deref()
    }

    pub fn set_default_path(&mut self, path: Option<PathBuf>) {
        self.default_path = path;
    }

    /// Panics in spirit, but returns an error instead: every key declared
    /// anywhere in the tree must have been consumed by a getter.
    pub fn touched_assert(&self) -> Result<(), CrateError> {
        self.root.touched_assert()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("nurdlib_config_test_{name}_{:p}.cfg", contents.as_ptr()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn empty_crate_block_round_trips() {
        let block = parse_snippet("CRATE(\"AyeBeEmpty\") { }").unwrap();
        let crate_block = block.get_block("CRATE").unwrap();
        assert_eq!(crate_block.param_string(0).unwrap(), "AyeBeEmpty");
        assert!(crate_block.block_children().is_empty());
    }

    #[test]
    fn simple_two_module_crate_with_barrier() {
        let src = "CRATE(\"Simple\") { \
            CAEN_V775(0x10000000){} \
            BARRIER{} \
            MESYTEC_MADC32(0x20000000){} \
        }";
        let path = write_tmp("two_module", src);
        let cfg = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let crate_block = cfg.root().get_block("CRATE").unwrap();
        let children = crate_block.block_children();
        let names: Vec<&str> = children.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["CAEN_V775", "BARRIER", "MESYTEC_MADC32"]);
    }

    #[test]
    fn unit_typed_gate_config() {
        let block = parse_snippet("GATE { width = 2 us offset = -25 ns }").unwrap();
        let gate = block.get_block("GATE").unwrap();
        assert_eq!(gate.get_double("width", Unit::Ns, 0.0, 10000.0).unwrap(), 2000.0);
        assert_eq!(gate.get_int32("offset", Unit::Ns, -100, 100).unwrap(), -25);
        assert!(gate.get_double("width", Unit::Mv, 0.0, 1.0).is_err());
    }

    #[test]
    fn include_cycle_is_detected() {
        let a_path = std::env::temp_dir().join("nurdlib_cycle_a.cfg");
        let b_path = std::env::temp_dir().join("nurdlib_cycle_b.cfg");
        std::fs::write(&a_path, format!("include \"{}\"\n", b_path.display())).unwrap();
        std::fs::write(&b_path, format!("include \"{}\"\n", a_path.display())).unwrap();

        let result = Config::load(&a_path);
        std::fs::remove_file(&a_path).ok();
        std::fs::remove_file(&b_path).ok();
        assert!(matches!(result, Err(CrateError::IncludeCycle(_))));
    }

    #[test]
    fn snippet_over_size_limit_is_rejected() {
        let huge = "x".repeat(SNIPPET_MAX_BYTES + 1);
        assert!(parse_snippet(&format!("name = \"{huge}\"")).is_err());
    }

    #[test]
    fn snippet_cannot_include() {
        assert!(parse_snippet("include \"whatever.cfg\"").is_err());
    }
}
