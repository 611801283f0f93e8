//! A named, readout-time-selectable subset of a crate's modules.

use crate::counter::Counter;

/// Selects which modules a given `readout(tag, ...)` call drains. Each tag
/// carries its own per-event cap and its own counter so unrelated trigger
/// sources sharing a crate don't cross-contaminate `event_diff`.
#[derive(Debug, Clone)]
pub struct Tag {
    pub id: u32,
    pub name: String,
    pub event_max: u32,
    pub counter: Counter,
    /// Indices into the owning crate's module list, in declaration order.
    pub module_indices: Vec<usize>,
}

impl Tag {
    pub fn new(id: u32, name: impl Into<String>, event_max: u32) -> Self {
        Self {
            id,
            name: name.into(),
            event_max,
            counter: Counter::NONE,
            module_indices: Vec::new(),
        }
    }

    pub fn add_module(&mut self, index: usize) {
        self.module_indices.push(index);
    }

    pub fn modules(&self) -> &[usize] {
        &self.module_indices
    }
}
