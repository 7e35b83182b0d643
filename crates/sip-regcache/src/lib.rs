// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! REGISTER cache for SIP back-to-back servers.
//!
//! Devices behind NAT register through the server, which forwards their
//! REGISTERs upstream with each contact replaced by an *alias*. The cache
//! remembers, per canonical AOR, which alias stands for which device contact
//! and where the device really is, so that:
//!
//! - requests for an alias can be routed back to the device,
//! - refresh REGISTERs can be answered locally while the upstream
//!   registration is still valid ([`RegisterCache::throttle_register`]),
//! - expired bindings disappear without per-entry timers ([`spawn_gc`]).
//!
//! # Example
//! ```
//! use sip_regcache::{RegCacheConfig, RegisterCache, RegisterContext, ThrottleDecision};
//!
//! let cache = RegisterCache::new(RegCacheConfig::default().with_max_ua_expires(60));
//! let ctx = RegisterContext::builder("<sip:alice@example.com>")
//!     .contact("<sip:alice@10.0.0.5:5060>;expires=3600")
//!     .source("192.0.2.1", 5062)
//!     .build()?;
//!
//! let now = 1_000;
//! cache.save_single_contact(&ctx, now)?;
//! let decision = cache.throttle_register(&ctx, now);
//! assert!(matches!(decision, ThrottleDecision::Forward(_)));
//! # Ok::<(), sip_regcache::RegCacheError>(())
//! ```

pub mod alias_codec;
mod aor;
mod cache;
pub mod config;
pub mod contact_hiding;
mod context;
mod error;
mod gc;
pub mod metrics;
mod registrar;
mod sharded;
pub mod storage;
mod throttle;
mod types;

pub use aor::{canonicalize_aor, compute_alias, DEFAULT_SIP_PORT};
pub use cache::{RegCacheStats, RegisterCache};
pub use config::{CacheMode, RegCacheConfig, MAX_BUCKET_COUNT};
pub use context::{parse_expires, split_contacts, uri_user, ContactValue, RegisterContext, RegisterContextBuilder};
pub use error::{RegCacheError, Result};
pub use gc::{spawn_gc, Clock, GcHandle, GcState, SystemClock};
pub use metrics::{RegCacheMetrics, RegCacheMetricsSnapshot};
pub use registrar::{ForwardContact, RegistrarReply, ReplyContact};
pub use sharded::{siphash, Bucket, ShardedTable};
pub use storage::{NoopStorageHandler, RegCacheStorageHandler, TracingStorageHandler};
pub use throttle::{ForwardReason, ThrottleDecision};
pub use types::{AliasEntry, AorEntry, Binding, BindingKey, ContactKey, Transport};
