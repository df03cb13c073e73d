//! Opt-in hot-path counters (`VMPEEK_PERF=1`) and log setup.
//!
//! Counters are summarised through `tracing` under the `vmpeek::perf` target every
//! few hundred samples, so they land wherever the log sink points.

pub mod logging;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

const REPORT_EVERY: u64 = 256;

static ENABLED: Lazy<bool> = Lazy::new(|| {
    std::env::var("VMPEEK_PERF").is_ok_and(|value| !value.is_empty() && value != "0")
});

static COUNTERS: Lazy<Mutex<HashMap<&'static str, Counter>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Default, Clone, PartialEq)]
struct Counter {
    samples: u64,
    total: Duration,
    slowest: Duration,
    bytes: u64,
    level: u64,
}

impl Counter {
    fn mean(&self) -> Duration {
        match u32::try_from(self.samples) {
            Ok(0) => Duration::ZERO,
            Ok(samples) => self.total / samples,
            Err(_) => Duration::ZERO,
        }
    }

    fn report(&self, label: &'static str) {
        debug!(
            target: "vmpeek::perf",
            label,
            samples = self.samples,
            mean_us = self.mean().as_micros() as u64,
            slowest_us = self.slowest.as_micros() as u64,
            bytes = self.bytes,
            level = self.level,
        );
    }
}

fn update(label: &'static str, apply: impl FnOnce(&mut Counter)) {
    if !*ENABLED {
        return;
    }
    let mut counters = COUNTERS.lock();
    let counter = counters.entry(label).or_default();
    counter.samples += 1;
    apply(counter);
    if counter.samples % REPORT_EVERY == 0 {
        counter.report(label);
    }
}

/// Bytes moved by one read or write.
pub fn record_bytes(label: &'static str, bytes: usize) {
    update(label, |counter| counter.bytes += bytes as u64);
}

/// Current size of something that grows and shrinks, e.g. rows held by the window.
pub fn record_level(label: &'static str, level: u64) {
    update(label, |counter| counter.level = level);
}

/// Times the span between construction and drop under `label`.
pub struct PerfGuard {
    label: &'static str,
    start: Instant,
}

impl PerfGuard {
    pub fn new(label: &'static str) -> Option<Self> {
        ENABLED.then(|| Self {
            label,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        update(self.label, |counter| {
            counter.total += elapsed;
            counter.slowest = counter.slowest.max(elapsed);
        });
    }
}
