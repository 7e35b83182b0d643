// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Registration cache configuration.
//!
//! ```
//! use sip_regcache::{CacheMode, RegCacheConfig};
//!
//! let config = RegCacheConfig::default()
//!     .with_min_reg_expires(600)
//!     .with_max_ua_expires(120)
//!     .with_mode(CacheMode::RegisterCaching);
//! assert_eq!(config.bucket_count, 1024);
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Default number of buckets per index (2^10).
pub const DEFAULT_BUCKET_COUNT: usize = 1 << 10;

/// Largest number of buckets per index (2^24); larger requests are capped.
pub const MAX_BUCKET_COUNT: usize = 1 << 24;

/// Default duration of one full garbage collection cycle.
pub const DEFAULT_GC_CYCLE_SECS: u64 = 10;

/// Expiry applied when a REGISTER carries neither a contact `expires`
/// parameter nor an Expires header.
pub const DEFAULT_REG_EXPIRES: u32 = 3600;

/// Seconds a cached answer must stay clear of the registrar-side expiry.
pub const DEFAULT_THROTTLE_BUFFER_SECS: u32 = 4;

/// Selects the REGISTER processing path the SIP layer takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Contacts are rewritten into encoded user parts; nothing is cached.
    ContactHiding,
    /// REGISTERs are forwarded to a registrar and refreshes are throttled.
    #[default]
    RegisterCaching,
    /// The server answers REGISTERs itself for a single contact.
    Registrar,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegCacheConfig {
    /// Buckets per index; rounded up to a power of two and capped at
    /// [`MAX_BUCKET_COUNT`].
    pub bucket_count: usize,

    /// Time for the garbage collector to visit every AOR bucket once.
    pub gc_cycle_secs: u64,

    /// Lower bound for the expiry requested from the upstream registrar.
    /// Zero disables the bound.
    pub min_reg_expires: u32,

    /// Upper bound for the expiry handed back to the device.
    pub max_ua_expires: Option<u32>,

    /// Expiry used when the request does not carry one.
    pub default_expires: Option<u32>,

    /// Safety margin kept between a throttled answer and the registrar expiry.
    pub throttle_buffer_secs: u32,

    pub mode: CacheMode,
}

impl Default for RegCacheConfig {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            gc_cycle_secs: DEFAULT_GC_CYCLE_SECS,
            min_reg_expires: 0,
            max_ua_expires: None,
            default_expires: Some(DEFAULT_REG_EXPIRES),
            throttle_buffer_secs: DEFAULT_THROTTLE_BUFFER_SECS,
            mode: CacheMode::default(),
        }
    }
}

impl RegCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = count;
        self
    }

    pub fn with_gc_cycle(mut self, cycle: Duration) -> Self {
        self.gc_cycle_secs = cycle.as_secs().max(1);
        self
    }

    pub fn with_min_reg_expires(mut self, secs: u32) -> Self {
        self.min_reg_expires = secs;
        self
    }

    pub fn with_max_ua_expires(mut self, secs: u32) -> Self {
        self.max_ua_expires = Some(secs);
        self
    }

    pub fn with_default_expires(mut self, secs: Option<u32>) -> Self {
        self.default_expires = secs;
        self
    }

    pub fn with_throttle_buffer(mut self, secs: u32) -> Self {
        self.throttle_buffer_secs = secs;
        self
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bucket count actually used by the indices.
    pub fn effective_bucket_count(&self) -> usize {
        self.bucket_count.clamp(1, MAX_BUCKET_COUNT).next_power_of_two()
    }

    pub fn gc_cycle(&self) -> Duration {
        Duration::from_secs(self.gc_cycle_secs.max(1))
    }

    /// Pause between two single-bucket sweeps.
    pub fn gc_tick(&self) -> Duration {
        self.gc_cycle() / self.effective_bucket_count() as u32
    }

    /// Expiry to request from the registrar for a device asking for `requested`.
    pub fn registrar_expires(&self, requested: u32) -> u32 {
        if requested == 0 {
            return 0;
        }
        requested.max(self.min_reg_expires)
    }

    /// Expiry to hand back to a device asking for `requested`.
    pub fn ua_expires(&self, requested: u32) -> u32 {
        match self.max_ua_expires {
            Some(max) if max > 0 => requested.min(max),
            _ => requested,
        }
    }
}
