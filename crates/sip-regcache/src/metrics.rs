// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cache counters.
//!
//! Every counter is an independent relaxed atomic, so recording never
//! contends with the bucket locks or with other workers. A snapshot is not
//! a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache-level counters (updates, removals, evictions, throttle outcomes).
#[derive(Debug, Clone, Default)]
pub struct RegCacheMetrics {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    updates: AtomicU64,
    removals: AtomicU64,
    evictions: AtomicU64,
    throttled: AtomicU64,
    forwarded: AtomicU64,
    alias_mismatches: AtomicU64,
    gc_sweeps: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegCacheMetricsSnapshot {
    pub updates: u64,
    pub removals: u64,
    pub evictions: u64,
    pub throttled: u64,
    pub forwarded: u64,
    pub alias_mismatches: u64,
    pub gc_sweeps: u64,
}

impl RegCacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_update(&self) {
        self.inner.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removals(&self, count: usize) {
        if count > 0 {
            self.inner.removals.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn record_sweep(&self, evicted: usize) {
        self.inner.gc_sweeps.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.inner.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    pub fn record_throttled(&self) {
        self.inner.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.inner.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alias_mismatch(&self) {
        self.inner.alias_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RegCacheMetricsSnapshot {
        let c = &self.inner;
        RegCacheMetricsSnapshot {
            updates: c.updates.load(Ordering::Relaxed),
            removals: c.removals.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            alias_mismatches: c.alias_mismatches.load(Ordering::Relaxed),
            gc_sweeps: c.gc_sweeps.load(Ordering::Relaxed),
        }
    }
}
