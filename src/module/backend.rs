//! Runtime backend selection for device modules.
//!
//! The upstream implementation picks a bus backend with preprocessor
//! macros at build time; here every compiled-in backend is always present
//! as a candidate and a module's own `backend = ...` config keyword picks
//! among them at `init_slow` time, falling back to the in-process `USER`
//! backend when the config doesn't name one.

use crate::bus::BackendSpec;
use crate::config::ConfigBlock;
use crate::error::CrateError;

pub fn resolve(block: &ConfigBlock) -> Result<BackendSpec, CrateError> {
    let mut candidates: Vec<&str> = vec!["USER"];
    #[cfg(feature = "backend-vme")]
    candidates.push("VME");
    #[cfg(feature = "backend-mvlc")]
    candidates.push("MVLC");

    let keyword = block.get_keyword("backend", &candidates).unwrap_or("USER");
    match keyword {
        #[cfg(feature = "backend-vme")]
        "VME" => {
            let device = block.get_string("vme_device")?;
            Ok(BackendSpec::Vme {
                device: std::path::PathBuf::from(device),
            })
        }
        #[cfg(feature = "backend-mvlc")]
        "MVLC" => {
            let addr = block.get_string("mvlc_addr")?;
            let addr = addr.parse().map_err(|_| CrateError::Identity {
                module: "backend".into(),
                detail: format!("invalid MVLC address: {addr}"),
            })?;
            Ok(BackendSpec::Mvlc { addr })
        }
        _ => Ok(BackendSpec::User),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_snippet;

    #[test]
    fn defaults_to_user_backend_when_unset() {
        let block = parse_snippet("X(0) {}").unwrap();
        let x = block.get_block("X").unwrap();
        assert!(matches!(resolve(x).unwrap(), BackendSpec::User));
    }
}
