//! The parsed config tree: blocks carrying positional parameters and an
//! ordered set of scalar/child-block entries, plus the unit- and
//! range-checked accessors the rest of the crate reads configuration
//! through.

use std::cell::Cell;

use crate::error::CrateError;

use super::unit::Unit;

/// Where a scalar came from, for error messages and the `TouchedAssertion`
/// source-location test.
#[derive(Debug, Clone)]
pub struct Source {
    pub path: String,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Empty,
    Double(f64),
    Integer(i64),
    Keyword(String),
    Range(i64, i64),
    String(String),
}

#[derive(Debug, Clone)]
pub struct Scalar {
    pub value: ScalarValue,
    pub unit: Unit,
    pub source: Source,
}

#[derive(Debug)]
struct Entry {
    key: String,
    values: Vec<Scalar>,
    touched: Cell<bool>,
}

#[derive(Debug)]
pub enum Node {
    Scalar(Entry),
    Block(ConfigBlock),
}

/// A named node in the config tree: `NAME(params) { children }`. The root
/// of a parsed file or snippet is itself a `ConfigBlock` with an empty
/// name and no params.
#[derive(Debug)]
pub struct ConfigBlock {
    pub name: String,
    pub params: Vec<Scalar>,
    children: Vec<Node>,
    pub source: Source,
}

fn config_err(key: &str, message: impl Into<String>, source: &Source) -> CrateError {
    CrateError::Config {
        key: key.to_string(),
        message: message.into(),
        path: source.path.clone(),
        line: source.line,
    }
}

impl ConfigBlock {
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            children: Vec::new(),
            source,
        }
    }

    pub(crate) fn push_scalar(&mut self, key: String, values: Vec<Scalar>) {
        self.children.push(Node::Scalar(Entry {
            key,
            values,
            touched: Cell::new(false),
        }));
    }

    pub(crate) fn push_block(&mut self, block: ConfigBlock) {
        self.children.push(Node::Block(block));
    }

    /// First child block named `name`.
    pub fn get_block(&self, name: &str) -> Option<&ConfigBlock> {
        self.children.iter().find_map(|n| match n {
            Node::Block(b) if b.name == name => Some(b),
            _ => None,
        })
    }

    /// All child blocks named `name`, in declaration order.
    pub fn get_blocks(&self, name: &str) -> Vec<&ConfigBlock> {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Block(b) if b.name == name => Some(b),
                _ => None,
            })
            .collect()
    }

    /// Every direct child block, in declaration order, regardless of name.
    pub fn block_children(&self) -> Vec<&ConfigBlock> {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Block(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    fn find_entry(&self, key: &str) -> Option<&Entry> {
        self.children.iter().find_map(|n| match n {
            Node::Scalar(e) if e.key == key => Some(e),
            _ => None,
        })
    }

    fn require_scalar(&self, key: &str) -> Result<&Scalar, CrateError> {
        let entry = self.find_entry(key).ok_or_else(|| {
            config_err(key, "missing required key", &self.source)
        })?;
        let scalar = entry.values.first().ok_or_else(|| {
            config_err(key, "key has no value", &self.source)
        })?;
        entry.touched.set(true);
        Ok(scalar)
    }

    fn number_in_unit(&self, key: &str, scalar: &Scalar, unit: Unit) -> Result<f64, CrateError> {
        let raw = match scalar.value {
            ScalarValue::Integer(i) => i as f64,
            ScalarValue::Double(d) => d,
            _ => return Err(config_err(key, "value is not numeric", &scalar.source)),
        };
        scalar
            .unit
            .convert(raw, unit)
            .ok_or_else(|| config_err(key, format!("unit mismatch: value is in {:?}", scalar.unit), &scalar.source))
    }

    pub fn get_double(&self, key: &str, unit: Unit, min: f64, max: f64) -> Result<f64, CrateError> {
        let scalar = self.require_scalar(key)?;
        let v = self.number_in_unit(key, scalar, unit)?;
        if v < min || v > max {
            return Err(config_err(key, format!("{v} out of range [{min}, {max}]"), &scalar.source));
        }
        Ok(v)
    }

    pub fn get_int32(&self, key: &str, unit: Unit, min: i32, max: i32) -> Result<i32, CrateError> {
        let scalar = self.require_scalar(key)?;
        let v = self.number_in_unit(key, scalar, unit)?.round() as i64;
        if v < min as i64 || v > max as i64 {
            return Err(config_err(key, format!("{v} out of range [{min}, {max}]"), &scalar.source));
        }
        Ok(v as i32)
    }

    pub fn get_uint32(&self, key: &str, unit: Unit, min: u32, max: u32) -> Result<u32, CrateError> {
        let scalar = self.require_scalar(key)?;
        let v = self.number_in_unit(key, scalar, unit)?.round() as i64;
        if v < min as i64 || v > max as i64 {
            return Err(config_err(key, format!("{v} out of range [{min}, {max}]"), &scalar.source));
        }
        Ok(v as u32)
    }

    pub fn get_bitmask(&self, key: &str, bit_lo: u32, bit_hi: u32) -> Result<u32, CrateError> {
        let scalar = self.require_scalar(key)?;
        let v = match scalar.value {
            ScalarValue::Integer(i) => i,
            _ => return Err(config_err(key, "bitmask value is not an integer", &scalar.source)),
        };
        let width = bit_hi - bit_lo + 1;
        let mask: u64 = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        Ok(((v as u64) & mask) as u32)
    }

    pub fn get_boolean(&self, key: &str) -> Result<bool, CrateError> {
        let scalar = self.require_scalar(key)?;
        match &scalar.value {
            ScalarValue::Integer(i) => Ok(*i != 0),
            ScalarValue::Keyword(k) => Ok(k.eq_ignore_ascii_case("true")),
            _ => Err(config_err(key, "value is not boolean-like", &scalar.source)),
        }
    }

    pub fn get_range(&self, key: &str) -> Result<(i64, i64), CrateError> {
        let scalar = self.require_scalar(key)?;
        match scalar.value {
            ScalarValue::Range(lo, hi) => Ok((lo, hi)),
            _ => Err(config_err(key, "value is not a range", &scalar.source)),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<&str, CrateError> {
        let scalar = self.require_scalar(key)?;
        match &scalar.value {
            ScalarValue::String(s) => Ok(s.as_str()),
            _ => Err(config_err(key, "value is not a string", &scalar.source)),
        }
    }

    pub fn get_keyword<'a>(&self, key: &str, candidates: &'a [&str]) -> Result<&'a str, CrateError> {
        let scalar = self.require_scalar(key)?;
        let k = match &scalar.value {
            ScalarValue::Keyword(k) => k,
            _ => return Err(config_err(key, "value is not a keyword", &scalar.source)),
        };
        candidates
            .iter()
            .find(|c| c.eq_ignore_ascii_case(k))
            .copied()
            .ok_or_else(|| config_err(key, format!("{k} is not one of {candidates:?}"), &scalar.source))
    }

    pub fn get_int_array(&self, key: &str, unit: Unit, min: i32, max: i32, dst: &mut [i32]) -> Result<(), CrateError> {
        let entry = self
            .find_entry(key)
            .ok_or_else(|| config_err(key, "missing required key", &self.source))?;
        if entry.values.len() != dst.len() {
            return Err(config_err(
                key,
                format!("array length mismatch: expected {}, got {}", dst.len(), entry.values.len()),
                &self.source,
            ));
        }
        for (slot, scalar) in dst.iter_mut().zip(entry.values.iter()) {
            let v = self.number_in_unit(key, scalar, unit)?.round() as i64;
            if v < min as i64 || v > max as i64 {
                return Err(config_err(key, format!("{v} out of range [{min}, {max}]"), &scalar.source));
            }
            *slot = v as i32;
        }
        entry.touched.set(true);
        Ok(())
    }

    pub fn get_double_array(&self, key: &str, unit: Unit, min: f64, max: f64, dst: &mut [f64]) -> Result<(), CrateError> {
        let entry = self
            .find_entry(key)
            .ok_or_else(|| config_err(key, "missing required key", &self.source))?;
        if entry.values.len() != dst.len() {
            return Err(config_err(
                key,
                format!("array length mismatch: expected {}, got {}", dst.len(), entry.values.len()),
                &self.source,
            ));
        }
        for (slot, scalar) in dst.iter_mut().zip(entry.values.iter()) {
            let v = self.number_in_unit(key, scalar, unit)?;
            if v < min || v > max {
                return Err(config_err(key, format!("{v} out of range [{min}, {max}]"), &scalar.source));
            }
            *slot = v;
        }
        entry.touched.set(true);
        Ok(())
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn param_int32(&self, idx: usize) -> Result<i32, CrateError> {
        let p = self.params.get(idx).ok_or_else(|| {
            config_err(&self.name, format!("missing param #{idx}"), &self.source)
        })?;
        match p.value {
            ScalarValue::Integer(i) => Ok(i as i32),
            _ => Err(config_err(&self.name, format!("param #{idx} is not an integer"), &p.source)),
        }
    }

    pub fn param_string(&self, idx: usize) -> Result<&str, CrateError> {
        let p = self.params.get(idx).ok_or_else(|| {
            config_err(&self.name, format!("missing param #{idx}"), &self.source)
        })?;
        match &p.value {
            ScalarValue::String(s) => Ok(s.as_str()),
            _ => Err(config_err(&self.name, format!("param #{idx} is not a string"), &p.source)),
        }
    }

    pub fn param_keyword<'a>(&self, idx: usize, candidates: &'a [&str]) -> Result<&'a str, CrateError> {
        let p = self.params.get(idx).ok_or_else(|| {
            config_err(&self.name, format!("missing param #{idx}"), &self.source)
        })?;
        let k = match &p.value {
            ScalarValue::Keyword(k) => k,
            _ => return Err(config_err(&self.name, format!("param #{idx} is not a keyword"), &p.source)),
        };
        candidates
            .iter()
            .find(|c| c.eq_ignore_ascii_case(k))
            .copied()
            .ok_or_else(|| config_err(&self.name, format!("{k} is not one of {candidates:?}"), &p.source))
    }

    /// Source location of the first value assigned to `key`, for
    /// diagnostics that need to point the user back at a config file.
    pub fn source_of(&self, key: &str) -> Option<&Source> {
        self.find_entry(key).and_then(|e| e.values.first()).map(|s| &s.source)
    }

    /// Returns the key of the first scalar entry (searched recursively)
    /// that was declared but never read by a getter. `None` means every
    /// declared key was consumed.
    pub fn first_untouched(&self) -> Option<String> {
        for node in &self.children {
            match node {
                Node::Scalar(e) if !e.touched.get() => return Some(e.key.clone()),
                Node::Block(b) => {
                    if let Some(k) = b.first_untouched() {
                        return Some(format!("{}.{}", b.name, k));
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn touched_assert(&self) -> Result<(), CrateError> {
        if let Some(key) = self.first_untouched() {
            return Err(config_err(&key, "declared but never read (likely a typo)", &self.source));
        }
        Ok(())
    }

    /// A plain, owned snapshot of this block and every descendant,
    /// preserving insertion order — what `config_dump` hands to the
    /// control surface.
    pub fn dump(&self) -> ConfigBlockDump {
        ConfigBlockDump {
            name: self.name.clone(),
            params: self.params.clone(),
            children: self
                .children
                .iter()
                .map(|n| match n {
                    Node::Scalar(e) => ConfigDump::Scalar {
                        key: e.key.clone(),
                        values: e.values.clone(),
                    },
                    Node::Block(b) => ConfigDump::Block(b.dump()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigDump {
    Scalar { key: String, values: Vec<Scalar> },
    Block(ConfigBlockDump),
}

#[derive(Debug, Clone)]
pub struct ConfigBlockDump {
    pub name: String,
    pub params: Vec<Scalar>,
    pub children: Vec<ConfigDump>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(value: ScalarValue, unit: Unit) -> Scalar {
        Scalar {
            value,
            unit,
            source: Source {
                path: "<test>".into(),
                line: 1,
                col: 1,
            },
        }
    }

    #[test]
    fn unit_typed_get_converts_and_range_checks() {
        let mut gate = ConfigBlock::new(
            "GATE",
            Source {
                path: "<test>".into(),
                line: 1,
                col: 1,
            },
        );
        gate.push_scalar("width".into(), vec![scalar(ScalarValue::Integer(2), Unit::Us)]);
        gate.push_scalar("offset".into(), vec![scalar(ScalarValue::Integer(-25), Unit::Ns)]);

        assert_eq!(gate.get_double("width", Unit::Ns, 0.0, 10000.0).unwrap(), 2000.0);
        assert_eq!(gate.get_int32("offset", Unit::Ns, -100, 100).unwrap(), -25);
        assert!(gate.get_double("width", Unit::Mv, 0.0, 1.0).is_err());
    }

    #[test]
    fn missing_key_is_an_error() {
        let block = ConfigBlock::new(
            "X",
            Source {
                path: "<test>".into(),
                line: 1,
                col: 1,
            },
        );
        assert!(block.get_int32("nope", Unit::None, 0, 1).is_err());
    }

    #[test]
    fn touched_assertion_flags_unread_keys() {
        let mut block = ConfigBlock::new(
            "X",
            Source {
                path: "<test>".into(),
                line: 1,
                col: 1,
            },
        );
        block.push_scalar("a".into(), vec![scalar(ScalarValue::Integer(1), Unit::None)]);
        assert!(block.touched_assert().is_err());
        let _ = block.get_int32("a", Unit::None, 0, 2).unwrap();
        assert!(block.touched_assert().is_ok());
    }

    #[test]
    fn dump_preserves_insertion_order() {
        let mut block = ConfigBlock::new(
            "X",
            Source {
                path: "<test>".into(),
                line: 1,
                col: 1,
            },
        );
        block.push_scalar("a".into(), vec![scalar(ScalarValue::Integer(1), Unit::None)]);
        block.push_block(ConfigBlock::new(
            "CHILD",
            Source {
                path: "<test>".into(),
                line: 2,
                col: 1,
            },
        ));
        block.push_scalar("b".into(), vec![scalar(ScalarValue::Integer(2), Unit::None)]);

        let dump = block.dump();
        assert_eq!(dump.name, "X");
        let keys: Vec<&str> = dump
            .children
            .iter()
            .map(|c| match c {
                ConfigDump::Scalar { key, .. } => key.as_str(),
                ConfigDump::Block(b) => b.name.as_str(),
            })
            .collect();
        assert_eq!(keys, vec!["a", "CHILD", "b"]);
    }

    #[test]
    fn array_getter_requires_exact_length() {
        let mut block = ConfigBlock::new(
            "X",
            Source {
                path: "<test>".into(),
                line: 1,
                col: 1,
            },
        );
        block.push_scalar(
            "values".into(),
            vec![
                scalar(ScalarValue::Integer(1), Unit::None),
                scalar(ScalarValue::Integer(2), Unit::None),
            ],
        );
        let mut two = [0i32; 2];
        block.get_int_array("values", Unit::None, 0, 10, &mut two).unwrap();
        assert_eq!(two, [1, 2]);

        let mut three = [0i32; 3];
        assert!(block.get_int_array("values", Unit::None, 0, 10, &mut three).is_err());
    }
}
