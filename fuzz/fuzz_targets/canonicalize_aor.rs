#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_regcache::canonicalize_aor;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 || data.len() > 1024 {
        return;
    }

    if let Ok(s) = std::str::from_utf8(data) {
        if let Some(canon) = canonicalize_aor(s) {
            assert_eq!(canonicalize_aor(&canon).as_deref(), Some(canon.as_str()));
        }
    }
});
