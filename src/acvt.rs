//! Adaptive conversion-time: the software-tuned window that grows until an
//! early-dead-time-release module no longer has to wait for digitization
//! to finish. Growth step and cap come from configuration; shrinking back
//! down is never automatic (left as deployment policy, see `DESIGN.md`).

/// Tracks one crate's ACVT window in nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct Acvt {
    current_ns: u32,
    step_ns: u32,
    cap_ns: u32,
}

impl Acvt {
    pub const fn new(initial_ns: u32, step_ns: u32, cap_ns: u32) -> Self {
        Self {
            current_ns: initial_ns,
            step_ns,
            cap_ns,
        }
    }

    pub const fn get_ns(&self) -> u32 {
        self.current_ns
    }

    /// `true` once growth is active, i.e. a "had-to-wait" event has ever
    /// pushed the window past its initial value.
    pub const fn has_grown(&self) -> bool {
        self.current_ns > 0
    }

    /// Grows the window by one step, clamped to the cap. Returns `true` if
    /// the window actually changed (the caller should then push the new
    /// value out to every registered module via `cvt_set`).
    pub fn grow(&mut self) -> bool {
        if self.current_ns >= self.cap_ns {
            return false;
        }
        let grown = (self.current_ns + self.step_ns).min(self.cap_ns);
        if grown == self.current_ns {
            return false;
        }
        self.current_ns = grown;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_step_until_capped() {
        let mut a = Acvt::new(0, 50, 120);
        assert!(a.grow());
        assert_eq!(a.get_ns(), 50);
        assert!(a.grow());
        assert_eq!(a.get_ns(), 100);
        assert!(a.grow());
        assert_eq!(a.get_ns(), 120);
        assert!(!a.grow());
        assert_eq!(a.get_ns(), 120);
    }

    #[test]
    fn zero_step_never_grows() {
        let mut a = Acvt::new(10, 0, 100);
        assert!(!a.grow());
        assert_eq!(a.get_ns(), 10);
    }
}
