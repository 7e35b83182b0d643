#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_regcache::{RegCacheConfig, RegisterCache, RegisterContext};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    // to | contact | expires
    let mut parts = s.splitn(3, '|');
    let to = parts.next().unwrap_or_default();
    let contact = parts.next().unwrap_or_default();

    let mut builder = RegisterContext::builder(to)
        .contact(contact)
        .source("192.0.2.1", 5060);
    if let Some(expires) = parts.next() {
        builder = builder.expires(expires);
    }

    if let Ok(ctx) = builder.build() {
        let cache = RegisterCache::new(RegCacheConfig::default().with_bucket_count(4));
        let _ = cache.save_single_contact(&ctx, 1_000);
        let _ = cache.throttle_register(&ctx, 1_000);
        cache.sweep_all(i64::MAX);
        assert_eq!(cache.stats().aliases, 0);
    }
});
