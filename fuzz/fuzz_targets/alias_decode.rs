#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_regcache::alias_codec::{decode, encode};

fuzz_target!(|data: &[u8]| {
    if data.len() > 4096 {
        return;
    }

    if let Ok(s) = std::str::from_utf8(data) {
        // Decoding should never panic; whatever decodes must re-encode to
        // something that decodes to the same value.
        if let Ok(value) = decode(s) {
            assert_eq!(decode(&encode(&value)).ok(), Some(value));
        }
    }
});
