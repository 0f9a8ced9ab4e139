//! Host time sources.
//!
//! The driver's only timing needs are a monotonic nanosecond counter (for
//! bounding busy-waits) and millisecond sleeps (scan-converter settle
//! delays). In production that is the host monotonic clock; tests drive a
//! [`VirtualClock`] deterministically, the same split the rest of the stack
//! uses for timer devices.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait HostClock: Send + Sync {
    /// Current monotonic time in nanoseconds since an arbitrary origin.
    fn now_ns(&self) -> u64;

    /// Blocks the calling context for `ms` milliseconds.
    fn sleep_ms(&self, ms: u64);
}

/// Real host clock backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Deterministic virtual clock.
///
/// Cloning yields handles onto the same timeline. `sleep_ms` advances the
/// clock instead of blocking, so code written against [`HostClock`] runs to
/// completion instantly under test.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now_ns: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ns(&self, ns: u64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
    }
}

impl HostClock for VirtualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance_ns(ms * 1_000_000);
    }
}
