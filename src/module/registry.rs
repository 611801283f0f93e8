//! Maps a config-file type keyword (`CAEN_V775`, `MESYTEC_MADC32`, ...) to
//! a constructor, and auto-registers each type's default config file so a
//! bare `MODULE_TYPE(addr) {}` block picks up vendor defaults without the
//! user having to `include` them by hand.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::config::ConfigBlock;
use crate::error::CrateError;

use super::ModuleFactory;

struct Entry {
    factory: ModuleFactory,
    auto_config: Option<String>,
}

fn registry() -> &'static Mutex<HashMap<String, Entry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `type_keyword` (matched case-insensitively against config
/// block names) with its constructor. Called once per device module at
/// process start, mirroring each vendor file's own `_setup_`.
pub fn register(type_keyword: &str, factory: ModuleFactory) {
    registry().lock().unwrap().insert(
        type_keyword.to_ascii_uppercase(),
        Entry {
            factory,
            auto_config: None,
        },
    );
}

/// Associates a type keyword with a default config file that `crate`
/// construction transparently includes before parsing that type's block,
/// analogous to `config_auto_register`.
pub fn auto_register(type_keyword: &str, default_config_path: &str) {
    let mut guard = registry().lock().unwrap();
    let key = type_keyword.to_ascii_uppercase();
    match guard.get_mut(&key) {
        Some(entry) => entry.auto_config = Some(default_config_path.to_string()),
        None => {
            // A type can be auto-registered before its device module is
            // linked in (e.g. test doubles); keep the path, wire the
            // factory in on first real `register`.
            guard.insert(
                key,
                Entry {
                    factory: |_| Err(CrateError::UnknownModuleType("auto-registered without a factory".into())),
                    auto_config: Some(default_config_path.to_string()),
                },
            );
        }
    }
}

pub fn auto_config_path(type_keyword: &str) -> Option<String> {
    registry()
        .lock()
        .unwrap()
        .get(&type_keyword.to_ascii_uppercase())
        .and_then(|e| e.auto_config.clone())
}

pub fn construct(type_keyword: &str, block: &ConfigBlock) -> Result<Box<dyn super::ModuleProps>, CrateError> {
    let guard = registry().lock().unwrap();
    let entry = guard
        .get(&type_keyword.to_ascii_uppercase())
        .ok_or_else(|| CrateError::UnknownModuleType(type_keyword.to_string()))?;
    (entry.factory)(block)
}

/// Test-only: clears every registration so test suites don't leak state
/// between runs of different crate configurations.
#[cfg(test)]
pub fn clear() {
    registry().lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_snippet;

    fn dummy_factory(_block: &ConfigBlock) -> Result<Box<dyn super::super::ModuleProps>, CrateError> {
        Err(CrateError::UnknownModuleType("unused in this test".into()))
    }

    #[test]
    fn unknown_type_is_an_error() {
        clear();
        let block = parse_snippet("X(0) {}").unwrap();
        let x = block.get_block("X").unwrap();
        assert!(construct("X", x).is_err());
    }

    #[test]
    fn registered_type_constructs_via_its_factory() {
        clear();
        register("X", dummy_factory);
        let block = parse_snippet("X(0) {}").unwrap();
        let x = block.get_block("X").unwrap();
        let err = construct("X", x).unwrap_err();
        assert!(matches!(err, CrateError::UnknownModuleType(_)));
    }

    #[test]
    fn auto_register_records_default_config_before_factory_exists() {
        clear();
        auto_register("Y", "y_defaults.cfg");
        assert_eq!(auto_config_path("Y").as_deref(), Some("y_defaults.cfg"));
    }
}
