// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Storage/event hook notified of every cache mutation.
//!
//! The cache calls the handler after it has released its bucket locks, so an
//! implementation may call back into the cache.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_regcache::{RegCacheConfig, RegisterCache, TracingStorageHandler};
//!
//! let cache = RegisterCache::with_storage_handler(
//!     RegCacheConfig::default(),
//!     Arc::new(TracingStorageHandler),
//! );
//! ```

use crate::types::AliasEntry;

/// Receives binding lifecycle events.
///
/// Implementations should be cheap; they run on the thread that performed
/// the cache operation (or on the garbage collector task).
pub trait RegCacheStorageHandler: Send + Sync + 'static {
    /// A binding and its alias were removed (unregister or eviction).
    fn on_delete(&self, _aor: &str, _contact_uri: &str, _alias: &str) {}

    /// A binding was created or refreshed.
    fn on_update(&self, _aor: &str, _alias: &str, _registrar_expire: i64, _entry: &AliasEntry) {}

    /// Only the device-side expiry of an alias changed.
    fn on_update_expires(&self, _alias: &str, _ua_expire: i64) {}
}

/// Handler used when none is configured.
#[derive(Debug, Default)]
pub struct NoopStorageHandler;

impl RegCacheStorageHandler for NoopStorageHandler {}

/// Logs every event via `tracing`.
#[derive(Debug, Default)]
pub struct TracingStorageHandler;

impl RegCacheStorageHandler for TracingStorageHandler {
    fn on_delete(&self, aor: &str, contact_uri: &str, alias: &str) {
        tracing::info!(aor, contact = contact_uri, alias, "binding deleted");
    }

    fn on_update(&self, aor: &str, alias: &str, registrar_expire: i64, entry: &AliasEntry) {
        tracing::info!(
            aor,
            alias,
            registrar_expire,
            ua_expire = entry.ua_expire,
            contact = %entry.contact_uri,
            source = %format_args!("{}:{}", entry.source_ip, entry.source_port),
            "binding updated"
        );
    }

    fn on_update_expires(&self, alias: &str, ua_expire: i64) {
        tracing::debug!(alias, ua_expire, "alias expiry updated");
    }
}
