//! Physical units a config scalar can be tagged with, and the conversion
//! rules `get_*` uses to enforce "the caller asked for the right quantity".

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    None,
    Mhz,
    Khz,
    Ns,
    Ps,
    Us,
    Ms,
    S,
    V,
    Mv,
    B,
    Kib,
    Mib,
    Fc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    None,
    Frequency,
    Time,
    Voltage,
    Bytes,
    Charge,
}

impl Unit {
    /// Parses the bare lowercase suffix identifiers the config lexer
    /// recognizes immediately after a numeric literal.
    pub fn from_suffix(s: &str) -> Option<Unit> {
        Some(match s {
            "none" => Unit::None,
            "mhz" => Unit::Mhz,
            "khz" => Unit::Khz,
            "ns" => Unit::Ns,
            "ps" => Unit::Ps,
            "us" => Unit::Us,
            "ms" => Unit::Ms,
            "s" => Unit::S,
            "v" => Unit::V,
            "mv" => Unit::Mv,
            "b" => Unit::B,
            "kib" => Unit::Kib,
            "mib" => Unit::Mib,
            "fc" => Unit::Fc,
            _ => return None,
        })
    }

    fn group(self) -> Group {
        match self {
            Unit::None => Group::None,
            Unit::Mhz | Unit::Khz => Group::Frequency,
            Unit::Ns | Unit::Ps | Unit::Us | Unit::Ms | Unit::S => Group::Time,
            Unit::V | Unit::Mv => Group::Voltage,
            Unit::B | Unit::Kib | Unit::Mib => Group::Bytes,
            Unit::Fc => Group::Charge,
        }
    }

    /// Scale factor to the group's base unit (seconds, hertz, volts,
    /// bytes). `None`/`Fc` are single-member groups and scale by 1.
    fn to_base(self) -> f64 {
        match self {
            Unit::None | Unit::Fc => 1.0,
            Unit::Mhz => 1e6,
            Unit::Khz => 1e3,
            Unit::S => 1.0,
            Unit::Ms => 1e-3,
            Unit::Us => 1e-6,
            Unit::Ns => 1e-9,
            Unit::Ps => 1e-12,
            Unit::V => 1.0,
            Unit::Mv => 1e-3,
            Unit::B => 1.0,
            Unit::Kib => 1024.0,
            Unit::Mib => 1024.0 * 1024.0,
        }
    }

    /// Converts `value` tagged with `self` into `target`'s scale. `None`
    /// when the two units belong to different physical quantities — the
    /// caller asked for the wrong kind of value entirely.
    pub fn convert(self, value: f64, target: Unit) -> Option<f64> {
        if self.group() != target.group() {
            return None;
        }
        Some(value * self.to_base() / target.to_base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_within_time_group() {
        assert_eq!(Unit::Us.convert(2.0, Unit::Ns), Some(2000.0));
        assert_eq!(Unit::Ns.convert(-25.0, Unit::Ns), Some(-25.0));
    }

    #[test]
    fn rejects_cross_group_conversion() {
        assert_eq!(Unit::Ns.convert(1.0, Unit::Mv), None);
    }

    #[test]
    fn none_only_matches_none() {
        assert_eq!(Unit::None.convert(5.0, Unit::None), Some(5.0));
        assert_eq!(Unit::None.convert(5.0, Unit::B), None);
    }
}
