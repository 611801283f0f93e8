//! Checked, monotonic windows into the caller's event-data backing store.

/// A writable window into event-data storage owned by the caller. `advance`
/// shrinks the window from the front and can never move past the original
/// end or go backwards. Internally tracked as a cursor into the full
/// backing slice so a just-written region can be read back via
/// [`Self::written_since`] without re-borrowing the caller's buffer.
pub struct EventBuffer<'a> {
    full: &'a mut [u8],
    cursor: usize,
}

impl<'a> EventBuffer<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { full: data, cursor: 0 }
    }

    pub fn bytes(&self) -> usize {
        self.full.len() - self.cursor
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.full[self.cursor..]
    }

    /// Writes `src` at the front of the window and advances past it.
    /// Fails (returning `false`, the `DATA_TOO_MUCH` condition) if `src` is
    /// larger than the remaining window.
    pub fn write(&mut self, src: &[u8]) -> bool {
        if src.len() > self.bytes() {
            return false;
        }
        let start = self.cursor;
        self.full[start..start + src.len()].copy_from_slice(src);
        self.cursor += src.len();
        true
    }

    /// Shrinks the window so that only `new_len` trailing bytes remain
    /// writable, i.e. advances the front by `bytes() - new_len`.
    ///
    /// # Panics
    /// In debug builds, panics if `new_len` would grow the window
    /// (non-monotonic advance).
    pub fn advance(&mut self, new_len: usize) {
        let remaining = self.bytes();
        debug_assert!(new_len <= remaining, "event buffer advance is not monotonic: {remaining} -> {new_len}");
        let new_len = new_len.min(remaining);
        self.cursor = self.full.len() - new_len;
    }

    /// A handle to the window's current write position, for later use with
    /// [`Self::written_since`].
    pub fn mark(&self) -> usize {
        self.cursor
    }

    /// A read-only view of the bytes written into the window since `mark`
    /// was taken, for immediately parsing what a module's `readout` just
    /// produced.
    pub fn written_since(&self, mark: usize) -> EventConstBuffer<'_> {
        EventConstBuffer::new(&self.full[mark..self.cursor])
    }
}

/// A read-only counterpart used while parsing just-written event data.
#[derive(Clone, Copy)]
pub struct EventConstBuffer<'a> {
    data: &'a [u8],
}

impl<'a> EventConstBuffer<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub const fn bytes(&self) -> usize {
        self.data.len()
    }

    pub const fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    pub fn advance(&mut self, new_len: usize) {
        debug_assert!(new_len <= self.data.len(), "event buffer advance is not monotonic");
        let new_len = new_len.min(self.data.len());
        let data = self.data;
        let split_at = data.len() - new_len;
        self.data = &data[split_at..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_shrinks_monotonically() {
        let mut store = [0u8; 16];
        let mut eb = EventBuffer::new(&mut store);
        assert_eq!(eb.bytes(), 16);
        eb.advance(10);
        assert_eq!(eb.bytes(), 10);
        eb.advance(4);
        assert_eq!(eb.bytes(), 4);
    }

    #[test]
    #[should_panic]
    fn advance_backwards_panics_in_debug() {
        let mut store = [0u8; 16];
        let mut eb = EventBuffer::new(&mut store);
        eb.advance(4);
        eb.advance(10);
    }

    #[test]
    fn write_advances_and_rejects_overflow() {
        let mut store = [0u8; 4];
        let mut eb = EventBuffer::new(&mut store);
        assert!(eb.write(&[1, 2]));
        assert_eq!(eb.bytes(), 2);
        assert!(!eb.write(&[1, 2, 3]));
        assert!(eb.write(&[3, 4]));
        assert_eq!(eb.bytes(), 0);
        assert_eq!(store, [1, 2, 3, 4]);
    }

    #[test]
    fn written_since_reports_exactly_the_bytes_of_the_last_write() {
        let mut store = [0u8; 8];
        let mut eb = EventBuffer::new(&mut store);
        eb.write(&[9, 9]);
        let mark = eb.mark();
        eb.write(&[1, 2, 3]);
        assert_eq!(eb.written_since(mark).as_slice(), &[1, 2, 3]);
    }
}
