// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Background eviction of expired bindings.
//!
//! The collector visits one AOR bucket per tick so that a full pass over the
//! table takes one GC cycle. A sweep never holds more than one AOR bucket
//! lock, and the alias/contact cleanup for each evicted binding runs after
//! that lock has been released.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{RegisterCache, RemovedBinding};

/// Source of the current time in seconds.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Running,
    Stopped,
}

impl RegisterCache {
    /// Evicts every binding of AOR bucket `index` with `registrar_expire <= now`.
    ///
    /// Returns the number of bindings evicted.
    pub fn sweep_bucket(&self, index: usize, now: i64) -> usize {
        let expired: Vec<RemovedBinding> = {
            let mut aors = self.aor_index.get_bucket(index).lock();
            let mut expired = Vec::new();
            aors.retain(|aor, entry| {
                entry.retain(|key, binding| {
                    if binding.registrar_expire > now {
                        return true;
                    }
                    debug!(
                        aor = %aor,
                        binding = %key,
                        alias = %binding.alias,
                        expire = binding.registrar_expire,
                        "binding expired"
                    );
                    expired.push(RemovedBinding {
                        aor: aor.clone(),
                        contact_uri: key.contact_uri.clone(),
                        alias: binding.alias.clone(),
                    });
                    false
                });
                if entry.is_empty() {
                    debug!(aor = %aor, "delete empty AOR");
                }
                !entry.is_empty()
            });
            expired
        };

        let mut evicted = 0;
        for removed in &expired {
            if self.purge_expired_alias(&removed.aor, &removed.alias) {
                self.storage()
                    .on_delete(&removed.aor, &removed.contact_uri, &removed.alias);
                evicted += 1;
            }
        }
        self.metrics().record_sweep(evicted);
        evicted
    }

    /// Sweeps every AOR bucket once.
    pub fn sweep_all(&self, now: i64) -> usize {
        (0..self.bucket_count())
            .map(|index| self.sweep_bucket(index, now))
            .sum()
    }

    /// Drops the alias and contact entries of an evicted binding unless the
    /// binding was re-created after the sweep released the AOR bucket.
    ///
    /// Returns `true` only if this call removed the alias entry.
    fn purge_expired_alias(&self, aor: &str, alias: &str) -> bool {
        let aors = self.aor_index.bucket_for(aor).lock();
        let recreated = aors
            .get(aor)
            .is_some_and(|entry| entry.values().any(|b| b.alias == alias));
        if recreated {
            debug!(aor, alias, "binding re-created before purge");
            return false;
        }
        // false if the alias meanwhile moved to another AOR or is gone
        self.remove_alias_entry_locked(alias, |entry| entry.aor == aor)
    }
}

/// Handle of a running garbage collector task.
pub struct GcHandle {
    state: watch::Sender<GcState>,
    task: JoinHandle<()>,
}

impl GcHandle {
    pub fn state(&self) -> GcState {
        *self.state.borrow()
    }

    /// Asks the collector to stop; no sweep starts afterwards.
    pub fn stop(&self) {
        self.state.send_replace(GcState::Stopped);
    }

    /// Stops the collector and waits for the task to finish.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }
}

/// Spawns the collector on the current tokio runtime.
pub fn spawn_gc(cache: Arc<RegisterCache>, clock: Arc<dyn Clock>) -> GcHandle {
    let (state, mut rx) = watch::channel(GcState::Running);
    let tick = cache.config().gc_tick();
    let buckets = cache.bucket_count();

    info!(buckets, tick_ms = tick.as_millis() as u64, "starting registration cache GC");

    let task = tokio::spawn(async move {
        let mut index = 0usize;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *rx.borrow() == GcState::Stopped {
                break;
            }
            cache.sweep_bucket(index, clock.now());
            index = (index + 1) % buckets;
        }
        info!("registration cache GC stopped");
    });

    GcHandle { state, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegCacheConfig;
    use crate::types::AliasEntry;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    struct FixedClock(AtomicI64);

    impl Clock for FixedClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn cache() -> RegisterCache {
        RegisterCache::new(
            RegCacheConfig::default()
                .with_bucket_count(4)
                .with_gc_cycle(Duration::from_secs(4)),
        )
    }

    fn entry(aor: &str, n: u32) -> AliasEntry {
        AliasEntry::new(aor, format!("sip:dev{}@10.0.0.{}", n, n), format!("10.0.0.{}", n), 5060)
            .with_ua_expire(900)
    }

    #[test]
    fn sweep_removes_only_expired() {
        let cache = cache();
        cache.update("expired", 1600, entry("sip:alice@example.com", 1)).unwrap();
        cache.update("alive", 1700, entry("sip:alice@example.com", 2)).unwrap();

        assert_eq!(cache.sweep_all(1600), 1);
        assert!(cache.find_alias_entry("expired").is_none());
        assert!(cache.find_by_contact("sip:dev1@10.0.0.1", "10.0.0.1", 5060).is_none());

        let alive = cache.find_alias_entry("alive").unwrap();
        assert_eq!(alive.ua_expire, 900);
        assert_eq!(cache.stats().bindings, 1);
    }

    #[test]
    fn unconfirmed_bindings_are_evicted() {
        let cache = cache();
        cache.update("a", 0, entry("sip:alice@example.com", 1)).unwrap();
        assert_eq!(cache.sweep_all(1), 1);
        assert_eq!(cache.stats().aliases, 0);
    }

    #[test]
    fn recreated_binding_keeps_alias() {
        let cache = cache();
        cache.update("a", 1600, entry("sip:alice@example.com", 1)).unwrap();

        let index = cache.aor_index.bucket_index("sip:alice@example.com");
        // emulate the race: evict the binding, then re-create it before purge
        {
            let mut aors = cache.aor_index.get_bucket(index).lock();
            aors.clear();
        }
        cache.update("a", 2000, entry("sip:alice@example.com", 1)).unwrap();
        assert!(!cache.purge_expired_alias("sip:alice@example.com", "a"));
        assert!(cache.find_alias_entry("a").is_some());
    }

    #[test]
    fn alias_moved_to_other_aor_is_not_purged() {
        let cache = cache();
        cache.update("a", 1600, entry("sip:alice@example.com", 1)).unwrap();

        let index = cache.aor_index.bucket_index("sip:alice@example.com");
        {
            let mut aors = cache.aor_index.get_bucket(index).lock();
            aors.clear();
        }
        cache.update("a", 2000, entry("sip:bob@example.com", 1)).unwrap();

        assert!(!cache.purge_expired_alias("sip:alice@example.com", "a"));
        let moved = cache.find_alias_entry("a").unwrap();
        assert_eq!(moved.aor, "sip:bob@example.com");
        assert_eq!(
            cache.find_by_contact("sip:dev1@10.0.0.1", "10.0.0.1", 5060).unwrap().alias,
            "a"
        );
        assert_eq!(cache.metrics().snapshot().evictions, 0);
    }

    #[test]
    fn sweep_counts_metrics() {
        let cache = cache();
        cache.update("a", 10, entry("sip:alice@example.com", 1)).unwrap();
        cache.sweep_all(20);
        let snap = cache.metrics().snapshot();
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.gc_sweeps, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn background_gc_evicts_after_one_cycle() {
        let cache = Arc::new(cache());
        cache.update("a", 1600, entry("sip:alice@example.com", 1)).unwrap();
        cache.update("b", 5000, entry("sip:bob@example.com", 2)).unwrap();

        let clock = Arc::new(FixedClock(AtomicI64::new(1000)));
        let handle = spawn_gc(cache.clone(), clock.clone());
        assert_eq!(handle.state(), GcState::Running);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.stats().bindings, 2);

        clock.0.store(1601, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(cache.find_alias_entry("a").is_none());
        assert!(cache.find_alias_entry("b").is_some());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_gc_does_not_sweep() {
        let cache = Arc::new(cache());
        cache.update("a", 10, entry("sip:alice@example.com", 1)).unwrap();

        let handle = spawn_gc(cache.clone(), Arc::new(FixedClock(AtomicI64::new(100))));
        handle.stop();
        assert_eq!(handle.state(), GcState::Stopped);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(cache.find_alias_entry("a").is_some());
        handle.shutdown().await;
    }
}
