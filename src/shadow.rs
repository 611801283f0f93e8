//! Shadow readout: a background worker that drains a module's hardware
//! buffer into a double-buffered store while foreground readout is idle,
//! so the next normal `readout` can consume already-fetched bytes instead
//! of blocking on the bus.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the worker backs off after finding the half it wants to write
/// into still unread, before retrying.
pub const DEFAULT_BACKPRESSURE_RETRY: Duration = Duration::from_millis(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The error "repeated failure" in the spec's backpressure description
/// maps onto: more than this many consecutive stalled swaps surfaces
/// `DATA_TOO_MUCH` to the foreground instead of silently blocking it.
pub const MAX_CONSECUTIVE_STALLS: u32 = 50;

/// Two fixed-capacity halves; the worker fills one while the foreground
/// consumes the other. A mutex protects only the bookkeeping (which half
/// is which, how many bytes are valid) — never the bulk copy itself.
pub struct ShadowDoubleBuffer {
    capacity: usize,
    buf: [Vec<u8>; 2],
    len: [usize; 2],
    write_half: usize,
    read_ready: [bool; 2],
    overflow_count: u32,
}

pub struct ShadowOverflow;

impl ShadowDoubleBuffer {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            buf: [vec![0u8; capacity], vec![0u8; capacity]],
            len: [0, 0],
            write_half: 0,
            read_ready: [false, false],
            overflow_count: 0,
        }
    }

    /// Called by the worker with freshly read bytes. Fails if the half it
    /// would write into still holds data the foreground hasn't consumed,
    /// or if `data` doesn't fit — both bump the overflow counter.
    pub fn try_fill(&mut self, data: &[u8]) -> Result<(), ShadowOverflow> {
        let w = self.write_half;
        if self.read_ready[w] || data.len() > self.capacity {
            self.overflow_count += 1;
            return Err(ShadowOverflow);
        }
        self.buf[w][..data.len()].copy_from_slice(data);
        self.len[w] = data.len();
        self.read_ready[w] = true;
        self.write_half = 1 - w;
        Ok(())
    }

    /// Called by foreground readout. Returns the most recently completed
    /// half, if any, and marks it consumed.
    pub fn take_filled(&mut self) -> Option<&[u8]> {
        let r = 1 - self.write_half;
        if self.read_ready[r] {
            self.read_ready[r] = false;
            Some(&self.buf[r][..self.len[r]])
        } else {
            None
        }
    }

    /// Drains and resets the overflow counter accumulated since the last
    /// call; a non-zero result means the foreground should raise
    /// `DATA_TOO_MUCH` for this module.
    pub fn take_overflow_count(&mut self) -> u32 {
        std::mem::take(&mut self.overflow_count)
    }

    /// Size of each half, for control-surface introspection.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ShadowDoubleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the background thread draining one module's shadow buffer.
/// `read_fn` is the engine's closure over the module's `readout_shadow`,
/// called under whatever synchronization the engine uses to keep shadow
/// and foreground access to the same module serialized.
pub struct ShadowWorker {
    shutdown: Arc<AtomicBool>,
    stalls: Arc<AtomicU32>,
    handle: Option<JoinHandle<()>>,
}

impl ShadowWorker {
    pub fn spawn<F>(buffer: Arc<Mutex<ShadowDoubleBuffer>>, read_fn: F) -> Self
    where
        F: FnMut(&mut Vec<u8>) -> usize + Send + 'static,
    {
        Self::spawn_with_timing(buffer, read_fn, DEFAULT_POLL_INTERVAL, DEFAULT_BACKPRESSURE_RETRY)
    }

    fn spawn_with_timing<F>(
        buffer: Arc<Mutex<ShadowDoubleBuffer>>,
        mut read_fn: F,
        poll_interval: Duration,
        backpressure_retry: Duration,
    ) -> Self
    where
        F: FnMut(&mut Vec<u8>) -> usize + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stalls = Arc::new(AtomicU32::new(0));
        let shutdown_worker = Arc::clone(&shutdown);
        let stalls_worker = Arc::clone(&stalls);
        let handle = thread::spawn(move || {
            let mut scratch = Vec::new();
            while !shutdown_worker.load(Ordering::Relaxed) {
                scratch.clear();
                let n = read_fn(&mut scratch);
                if n == 0 {
                    thread::sleep(poll_interval);
                    continue;
                }
                let mut consecutive = 0u32;
                loop {
                    let filled = {
                        let mut guard = buffer.lock().unwrap();
                        guard.try_fill(&scratch[..n])
                    };
                    match filled {
                        Ok(()) => {
                            stalls_worker.store(0, Ordering::Relaxed);
                            break;
                        }
                        Err(_) => {
                            consecutive += 1;
                            stalls_worker.store(consecutive, Ordering::Relaxed);
                            if shutdown_worker.load(Ordering::Relaxed) || consecutive >= MAX_CONSECUTIVE_STALLS {
                                break;
                            }
                            thread::sleep(backpressure_retry);
                        }
                    }
                }
            }
        });
        Self {
            shutdown,
            stalls,
            handle: Some(handle),
        }
    }

    /// Consecutive backpressure stalls since the last successful swap;
    /// reaching [`MAX_CONSECUTIVE_STALLS`] means the worker gave up on
    /// this cycle and the foreground should raise `DATA_TOO_MUCH`.
    pub fn stalled_count(&self) -> u32 {
        self.stalls.load(Ordering::Relaxed)
    }

    /// Cancels the worker at its next safe point and blocks until joined.
    pub fn join(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ShadowWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_then_take_round_trips() {
        let mut b = ShadowDoubleBuffer::with_capacity(16);
        assert!(b.take_filled().is_none());
        b.try_fill(&[1, 2, 3]).unwrap();
        assert_eq!(b.take_filled(), Some(&[1u8, 2, 3][..]));
        assert!(b.take_filled().is_none());
    }

    #[test]
    fn unread_half_blocks_the_next_fill_into_it() {
        let mut b = ShadowDoubleBuffer::with_capacity(16);
        b.try_fill(&[1]).unwrap();
        b.try_fill(&[2]).unwrap();
        // write_half is now back to the first half, which is still unread.
        assert!(b.try_fill(&[3]).is_err());
        assert_eq!(b.take_overflow_count(), 1);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut b = ShadowDoubleBuffer::with_capacity(4);
        assert!(b.try_fill(&[0u8; 5]).is_err());
    }

    #[test]
    fn oversized_record_against_small_buffer_surfaces_too_much_instead_of_corrupting() {
        // S6: a 64-byte shadow buffer, a module emitting 128-byte records.
        let mut b = ShadowDoubleBuffer::with_capacity(64);
        let record = vec![0xAB_u8; 128];
        assert!(b.try_fill(&record).is_err());
        assert_eq!(b.take_overflow_count(), 1);
    }

    #[test]
    fn worker_drains_into_buffer_and_joins_cleanly() {
        let buffer = Arc::new(Mutex::new(ShadowDoubleBuffer::with_capacity(16)));
        let served = Arc::new(AtomicBool::new(false));
        let served_worker = Arc::clone(&served);
        let worker = ShadowWorker::spawn(Arc::clone(&buffer), move |dst| {
            if served_worker.swap(true, Ordering::Relaxed) {
                0
            } else {
                dst.extend_from_slice(&[9, 9]);
                2
            }
        });
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if buffer.lock().unwrap().take_filled().is_some() {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("worker never filled the buffer");
            }
            thread::sleep(Duration::from_millis(2));
        }
        worker.join();
    }
}
