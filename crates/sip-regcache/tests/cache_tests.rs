// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use sip_regcache::{
    canonicalize_aor, AliasEntry, RegCacheConfig, RegisterCache, RegisterContext, ThrottleDecision,
    Transport,
};

fn cache() -> RegisterCache {
    RegisterCache::new(RegCacheConfig::default().with_bucket_count(64))
}

#[test]
fn register_lookup_and_expire() {
    let cache = cache();
    let aor = canonicalize_aor("sip:alice@example.com").unwrap();
    let contact = "sip:alice@10.0.0.5:5060";

    let fields = AliasEntry::new(aor.as_str(), contact, "10.0.0.5", 5060)
        .with_transport(Transport::Udp)
        .with_ua_expire(1600);
    cache.update("ab12cd34", 1600, fields).unwrap();

    let binding = cache.get_alias(&aor, contact, "10.0.0.5").unwrap();
    assert_eq!(binding.alias, "ab12cd34");
    assert_eq!(binding.registrar_expire, 1600);

    assert_eq!(cache.sweep_all(1599), 0);
    assert!(cache.get_alias(&aor, contact, "10.0.0.5").is_some());

    assert_eq!(cache.sweep_all(1601), 1);
    assert!(cache.get_alias(&aor, contact, "10.0.0.5").is_none());
    assert!(cache.find_alias_entry("ab12cd34").is_none());
    assert!(cache.find_by_contact(contact, "10.0.0.5", 5060).is_none());
}

#[test]
fn canonical_aor_example() {
    assert_eq!(
        canonicalize_aor("sip:Bob@Example.com:5060;transport=tcp").as_deref(),
        Some("sip:Bob@Example.com")
    );
}

#[test]
fn full_sweep_removes_exactly_the_expired_bindings() {
    let cache = cache();
    let now = 10_000;

    for i in 0..200u32 {
        let aor = format!("sip:user{}@example.com", i % 37);
        let contact = format!("sip:dev{}@10.1.{}.{}", i, i / 250, i % 250);
        let ip = format!("192.0.2.{}", i % 250);
        let expire = if i % 3 == 0 { now - 1 } else { now + 100 + i as i64 };
        let fields = AliasEntry::new(aor.as_str(), contact.as_str(), ip.as_str(), 5060)
            .with_ua_expire(now + 50);
        cache.update(&format!("alias{}", i), expire, fields).unwrap();
    }

    let expired = (0..200u32).filter(|i| i % 3 == 0).count();
    assert_eq!(cache.sweep_all(now), expired);

    let stats = cache.stats();
    assert_eq!(stats.bindings, 200 - expired);
    assert_eq!(stats.aliases, 200 - expired);
    assert_eq!(stats.contacts, 200 - expired);

    for i in 0..200u32 {
        let alias = format!("alias{}", i);
        let entry = cache.find_alias_entry(&alias);
        if i % 3 == 0 {
            assert!(entry.is_none(), "{} survived", alias);
        } else {
            let entry = entry.unwrap();
            assert_eq!(entry.ua_expire, now + 50);
            let binding = cache
                .get_alias(&entry.aor, &entry.contact_uri, &entry.source_ip)
                .unwrap();
            assert_eq!(binding.registrar_expire, now + 100 + i as i64);
        }
    }

    assert_eq!(cache.metrics().snapshot().evictions, expired as u64);
}

#[test]
fn readers_never_see_partial_updates() {
    let cache = Arc::new(cache());
    let aor = "sip:alice@example.com";
    let contact = "sip:alice@10.0.0.5";
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let cache = cache.clone();
        let done = done.clone();
        thread::spawn(move || {
            for round in 0..2_000i64 {
                let port = 5060 + (round % 2) as u16;
                let fields = AliasEntry::new(aor, contact, "10.0.0.5", port).with_ua_expire(round);
                cache.update("a1", 10_000 + round, fields).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    if let Some(binding) = cache.get_alias(aor, contact, "10.0.0.5") {
                        assert_eq!(binding.alias, "a1");
                        let entry = cache.find_alias_entry(&binding.alias).unwrap();
                        assert_eq!(entry.aor, aor);
                        assert_eq!(entry.contact_uri, contact);
                    }
                    for port in [5060u16, 5061] {
                        if let Some(entry) = cache.find_by_contact(contact, "10.0.0.5", port) {
                            assert_eq!(entry.alias, "a1");
                            assert_eq!(entry.source_port, port);
                        }
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let stats = cache.stats();
    assert_eq!((stats.aors, stats.bindings, stats.aliases, stats.contacts), (1, 1, 1, 1));
}

#[test]
fn concurrent_writers_keep_indices_consistent() {
    let cache = Arc::new(cache());
    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..250u32 {
                    let aor = format!("sip:user{}@example.com", i % 10);
                    let contact = format!("sip:dev{}@10.0.0.{}", i, t);
                    let fields = AliasEntry::new(aor.as_str(), contact.as_str(), "192.0.2.1", 5060);
                    cache
                        .update(&format!("t{}-{}", t, i), 5_000, fields)
                        .unwrap();
                    if i % 5 == 0 {
                        cache.remove(&aor, &contact, &format!("t{}-{}", t, i));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.bindings, 8 * 200);
    assert_eq!(stats.aliases, stats.bindings);
    assert_eq!(stats.contacts, stats.bindings);
    // user0 and user5 lost every binding
    assert_eq!(stats.aors, 8);
}

#[test]
fn throttle_is_deterministic() {
    let build = || {
        let cache = RegisterCache::new(
            RegCacheConfig::default()
                .with_bucket_count(64)
                .with_max_ua_expires(120),
        );
        let ctx = RegisterContext::builder("sip:alice@example.com")
            .contact("<sip:alice@10.0.0.5>;expires=3600")
            .source("192.0.2.1", 5062)
            .build()
            .unwrap();
        let alias = cache.alias_for(&ctx, "sip:alice@10.0.0.5");
        cache
            .update(&alias, 5_000, ctx.alias_fields("sip:alice@10.0.0.5"))
            .unwrap();
        (cache, ctx)
    };

    let (first, ctx1) = build();
    let (second, ctx2) = build();
    for now in [1_000, 4_000, 4_870, 4_876, 4_900] {
        let a = first.throttle_register(&ctx1, now);
        let b = second.throttle_register(&ctx2, now);
        assert_eq!(a, b, "diverged at {}", now);
    }

    assert!(matches!(first.throttle_register(&ctx1, 1_000), ThrottleDecision::Reply(_)));
    assert!(first.throttle_register(&ctx1, 4_876).is_forward());
}
