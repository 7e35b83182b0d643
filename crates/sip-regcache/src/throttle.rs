// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! REGISTER throttling: answering refreshes from the cache.
//!
//! A refresh can be answered locally while the upstream registration still
//! outlives the expiry handed to the device by more than the throttle
//! buffer. Everything else is forwarded.

use smol_str::SmolStr;
use std::fmt;
use tracing::debug;

use crate::cache::RegisterCache;
use crate::context::RegisterContext;
use crate::registrar::ReplyContact;

/// Why a REGISTER has to go to the registrar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardReason {
    NoContacts,
    Wildcard,
    /// At least one contact unregisters.
    Unregister,
    /// Neither the request nor the configuration provides an expiry.
    NoExpires,
    NoBinding,
    /// The binding was never confirmed by the registrar.
    Unconfirmed,
    /// The upstream registration would expire before the device's.
    ExpiresTooClose,
    /// The device now talks from another address (NAT rebinding).
    SourceChanged,
    AliasGone,
}

impl ForwardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardReason::NoContacts => "no-contacts",
            ForwardReason::Wildcard => "wildcard",
            ForwardReason::Unregister => "unregister",
            ForwardReason::NoExpires => "no-expires",
            ForwardReason::NoBinding => "no-binding",
            ForwardReason::Unconfirmed => "unconfirmed",
            ForwardReason::ExpiresTooClose => "expires-too-close",
            ForwardReason::SourceChanged => "source-changed",
            ForwardReason::AliasGone => "alias-gone",
        }
    }
}

impl fmt::Display for ForwardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    Forward(ForwardReason),
    /// Answer the device with these contacts; the cache is already updated.
    Reply(Vec<ReplyContact>),
}

impl ThrottleDecision {
    pub fn is_forward(&self) -> bool {
        matches!(self, ThrottleDecision::Forward(_))
    }
}

struct Refresh {
    alias: SmolStr,
    uri: SmolStr,
    ua_expire: i64,
    /// Device-side expiry before this refresh, restored on rollback.
    previous: i64,
    expires: u32,
}

impl RegisterCache {
    /// Decides whether a REGISTER may be answered from the cache.
    ///
    /// Device-side expiries are only written once every contact passed the
    /// checks. If an alias vanishes while they are written, the ones already
    /// written are restored and the request is forwarded.
    pub fn throttle_register(&self, ctx: &RegisterContext, now: i64) -> ThrottleDecision {
        let decision = self.check_refresh(ctx, now);
        match &decision {
            ThrottleDecision::Forward(reason) => {
                debug!(aor = %ctx.aor, %reason, "forwarding REGISTER");
                self.metrics().record_forwarded();
            }
            ThrottleDecision::Reply(contacts) => {
                debug!(aor = %ctx.aor, contacts = contacts.len(), "answering REGISTER from cache");
                self.metrics().record_throttled();
            }
        }
        decision
    }

    fn check_refresh(&self, ctx: &RegisterContext, now: i64) -> ThrottleDecision {
        use ForwardReason::*;

        if ctx.wildcard {
            return ThrottleDecision::Forward(Wildcard);
        }
        if ctx.contacts.is_empty() {
            return ThrottleDecision::Forward(NoContacts);
        }

        let config = self.config();
        let mut requested = Vec::with_capacity(ctx.contacts.len());
        for contact in &ctx.contacts {
            match ctx.requested_expires(contact, config.default_expires) {
                None => return ThrottleDecision::Forward(NoExpires),
                Some(0) => return ThrottleDecision::Forward(Unregister),
                Some(expires) => requested.push(expires),
            }
        }

        let buffer = i64::from(config.throttle_buffer_secs);
        let mut refreshes = Vec::with_capacity(ctx.contacts.len());
        for (contact, requested) in ctx.contacts.iter().zip(requested) {
            let Some(binding) = self.get_alias(&ctx.aor, &contact.uri, &ctx.source_ip) else {
                return ThrottleDecision::Forward(NoBinding);
            };
            if binding.registrar_expire == 0 {
                return ThrottleDecision::Forward(Unconfirmed);
            }

            let expires = config.ua_expires(requested);
            let ua_expire = now + i64::from(expires);
            if ua_expire + buffer >= binding.registrar_expire {
                return ThrottleDecision::Forward(ExpiresTooClose);
            }

            let Some(entry) = self.find_alias_entry(&binding.alias) else {
                return ThrottleDecision::Forward(AliasGone);
            };
            if entry.source_ip != ctx.source_ip || entry.source_port != ctx.source_port {
                return ThrottleDecision::Forward(SourceChanged);
            }

            refreshes.push(Refresh {
                alias: binding.alias,
                uri: contact.uri.clone(),
                ua_expire,
                previous: entry.ua_expire,
                expires,
            });
        }

        for (committed, refresh) in refreshes.iter().enumerate() {
            // lost a race with GC or an unregister; the registrar decides
            if !self.update_alias_expires(&refresh.alias, refresh.ua_expire) {
                for done in refreshes[..committed].iter().rev() {
                    if !self.restore_alias_expires(&done.alias, done.ua_expire, done.previous) {
                        debug!(alias = %done.alias, "alias changed before rollback");
                    }
                }
                return ThrottleDecision::Forward(AliasGone);
            }
        }

        let contacts = refreshes
            .into_iter()
            .map(|refresh| ReplyContact {
                uri: refresh.uri,
                expires: refresh.expires,
            })
            .collect();
        ThrottleDecision::Reply(contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegCacheConfig;
    use crate::storage::RegCacheStorageHandler;
    use parking_lot::Mutex;
    use std::sync::{Arc, OnceLock, Weak};

    const AOR: &str = "sip:alice@example.com";
    const NOW: i64 = 1000;

    fn cache() -> RegisterCache {
        RegisterCache::new(
            RegCacheConfig::default()
                .with_bucket_count(16)
                .with_max_ua_expires(60),
        )
    }

    fn register(contact: &str, port: u16) -> RegisterContext {
        RegisterContext::builder(AOR)
            .contact(contact)
            .source("192.0.2.1", port)
            .build()
            .unwrap()
    }

    fn seed(cache: &RegisterCache, registrar_expire: i64) {
        let ctx = register("<sip:alice@10.0.0.5>", 5062);
        cache
            .update("a1", registrar_expire, ctx.alias_fields("sip:alice@10.0.0.5"))
            .unwrap();
    }

    #[test]
    fn answers_refresh_from_cache() {
        let cache = cache();
        seed(&cache, NOW + 3600);

        let decision = cache.throttle_register(&register("<sip:alice@10.0.0.5>;expires=3600", 5062), NOW);
        assert_eq!(
            decision,
            ThrottleDecision::Reply(vec![ReplyContact {
                uri: "sip:alice@10.0.0.5".into(),
                expires: 60
            }])
        );
        assert_eq!(cache.find_alias_entry("a1").unwrap().ua_expire, NOW + 60);
        assert_eq!(cache.metrics().snapshot().throttled, 1);
    }

    #[test]
    fn forwards_near_registrar_expiry() {
        let cache = cache();
        seed(&cache, NOW + 64);
        let decision = cache.throttle_register(&register("<sip:alice@10.0.0.5>", 5062), NOW);
        assert_eq!(decision, ThrottleDecision::Forward(ForwardReason::ExpiresTooClose));

        seed(&cache, NOW + 65);
        let decision = cache.throttle_register(&register("<sip:alice@10.0.0.5>", 5062), NOW);
        assert!(!decision.is_forward());
    }

    #[test]
    fn forwards_on_nat_rebinding() {
        let cache = cache();
        seed(&cache, NOW + 3600);
        let decision = cache.throttle_register(&register("<sip:alice@10.0.0.5>", 40000), NOW);
        assert_eq!(decision, ThrottleDecision::Forward(ForwardReason::SourceChanged));
        assert_eq!(cache.find_alias_entry("a1").unwrap().ua_expire, 0);
    }

    #[test]
    fn forwards_unknown_and_unconfirmed() {
        let cache = cache();
        let ctx = register("<sip:alice@10.0.0.5>", 5062);
        assert_eq!(
            cache.throttle_register(&ctx, NOW),
            ThrottleDecision::Forward(ForwardReason::NoBinding)
        );
        seed(&cache, 0);
        assert_eq!(
            cache.throttle_register(&ctx, NOW),
            ThrottleDecision::Forward(ForwardReason::Unconfirmed)
        );
    }

    #[test]
    fn forwards_unregister_and_wildcard() {
        let cache = cache();
        seed(&cache, NOW + 3600);
        assert_eq!(
            cache.throttle_register(&register("<sip:alice@10.0.0.5>;expires=0", 5062), NOW),
            ThrottleDecision::Forward(ForwardReason::Unregister)
        );

        let wildcard = RegisterContext::builder(AOR)
            .contact("*")
            .expires("0")
            .source("192.0.2.1", 5062)
            .build()
            .unwrap();
        assert_eq!(
            cache.throttle_register(&wildcard, NOW),
            ThrottleDecision::Forward(ForwardReason::Wildcard)
        );

        let query = RegisterContext::builder(AOR).source("192.0.2.1", 5062).build().unwrap();
        assert_eq!(
            cache.throttle_register(&query, NOW),
            ThrottleDecision::Forward(ForwardReason::NoContacts)
        );
    }

    #[test]
    fn forwards_without_any_expires() {
        let cache = RegisterCache::new(
            RegCacheConfig::default()
                .with_bucket_count(16)
                .with_default_expires(None),
        );
        seed(&cache, NOW + 3600);
        assert_eq!(
            cache.throttle_register(&register("<sip:alice@10.0.0.5>", 5062), NOW),
            ThrottleDecision::Forward(ForwardReason::NoExpires)
        );
    }

    #[test]
    fn one_failing_contact_forwards_all_without_writes() {
        let cache = cache();
        seed(&cache, NOW + 3600);
        let ctx = RegisterContext::builder(AOR)
            .contact("<sip:alice@10.0.0.5>, <sip:alice@10.0.0.6>")
            .source("192.0.2.1", 5062)
            .build()
            .unwrap();
        assert_eq!(
            cache.throttle_register(&ctx, NOW),
            ThrottleDecision::Forward(ForwardReason::NoBinding)
        );
        assert_eq!(cache.find_alias_entry("a1").unwrap().ua_expire, 0);
        assert_eq!(cache.metrics().snapshot().forwarded, 1);
    }

    /// Drops `a2` as soon as the expiry of `a1` is written.
    #[derive(Default)]
    struct RemoveOnWrite {
        cache: OnceLock<Weak<RegisterCache>>,
        written: Mutex<Vec<(String, i64)>>,
    }

    impl RegCacheStorageHandler for RemoveOnWrite {
        fn on_update_expires(&self, alias: &str, ua_expire: i64) {
            self.written.lock().push((alias.to_string(), ua_expire));
            if alias == "a1" {
                if let Some(cache) = self.cache.get().and_then(Weak::upgrade) {
                    cache.remove_alias("a2");
                }
            }
        }
    }

    #[test]
    fn vanished_alias_rolls_back_written_expires() {
        let handler = Arc::new(RemoveOnWrite::default());
        let cache = Arc::new(RegisterCache::with_storage_handler(
            RegCacheConfig::default()
                .with_bucket_count(16)
                .with_max_ua_expires(60),
            handler.clone(),
        ));
        let _ = handler.cache.set(Arc::downgrade(&cache));

        let ctx = RegisterContext::builder(AOR)
            .contact("<sip:alice@10.0.0.5>, <sip:alice@10.0.0.6>")
            .source("192.0.2.1", 5062)
            .build()
            .unwrap();
        cache
            .update("a1", NOW + 3600, ctx.alias_fields("sip:alice@10.0.0.5"))
            .unwrap();
        cache
            .update("a2", NOW + 3600, ctx.alias_fields("sip:alice@10.0.0.6"))
            .unwrap();

        assert_eq!(
            cache.throttle_register(&ctx, NOW),
            ThrottleDecision::Forward(ForwardReason::AliasGone)
        );
        assert_eq!(cache.find_alias_entry("a1").unwrap().ua_expire, 0);
        assert!(cache.find_alias_entry("a2").is_none());
        assert_eq!(
            handler.written.lock().as_slice(),
            &[("a1".to_string(), NOW + 60), ("a1".to_string(), 0)]
        );
        assert_eq!(cache.metrics().snapshot().throttled, 0);
    }

    #[test]
    fn rollback_keeps_newer_expiry() {
        let cache = cache();
        seed(&cache, NOW + 3600);
        assert!(cache.update_alias_expires("a1", NOW + 60));
        assert!(cache.update_alias_expires("a1", NOW + 90));
        assert!(!cache.restore_alias_expires("a1", NOW + 60, 0));
        assert_eq!(cache.find_alias_entry("a1").unwrap().ua_expire, NOW + 90);
        assert!(cache.restore_alias_expires("a1", NOW + 90, 0));
        assert_eq!(cache.find_alias_entry("a1").unwrap().ua_expire, 0);
    }
}
