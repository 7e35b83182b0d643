// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Address-of-record canonicalization and alias derivation.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::sharded::siphash;

/// Port omitted from canonical AORs.
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Characters a canonical user part keeps escaped (RFC 3261 §25.1 `user`).
const USER_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b',')
    .remove(b';')
    .remove(b'/');

const HOST_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Canonicalizes an AOR per RFC 3261 §10.3 step 5.
///
/// URI parameters and headers are removed, escaped characters are converted
/// to their unescaped form where the grammar allows it, and the port is
/// dropped when it equals 5060. User and host keep their case.
///
/// Returns `None` for malformed URIs and schemes other than `sip`/`sips`.
///
/// ```
/// use sip_regcache::canonicalize_aor;
///
/// assert_eq!(
///     canonicalize_aor("sip:Bob@Example.com:5060;transport=tcp").as_deref(),
///     Some("sip:Bob@Example.com")
/// );
/// assert_eq!(canonicalize_aor("tel:+15551234567"), None);
/// ```
pub fn canonicalize_aor(uri: &str) -> Option<String> {
    let uri = uri.trim();
    let (scheme, rest) = uri.split_once(':')?;
    let scheme = if scheme.eq_ignore_ascii_case("sip") {
        "sip"
    } else if scheme.eq_ignore_ascii_case("sips") {
        "sips"
    } else {
        tracing::debug!(uri, "unknown URI scheme");
        return None;
    };

    // Headers never belong to an AOR.
    let addr = rest.split_once('?').map_or(rest, |(addr, _)| addr);

    let (user, host_params) = match addr.split_once('@') {
        Some((userinfo, host)) => {
            // Drop a password, keep the user.
            let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
            if user.is_empty() {
                tracing::debug!(uri, "empty user part");
                return None;
            }
            (Some(canonical_user(user)?), host)
        }
        None => (None, addr),
    };

    let host_port = host_params
        .split_once(';')
        .map_or(host_params, |(host, _)| host)
        .trim();
    if host_port.is_empty() {
        tracing::debug!(uri, "malformed URI: empty host");
        return None;
    }

    let (host, port) = split_host_port(host_port)?;
    let host = canonical_host(host)?;

    let mut canon = String::with_capacity(uri.len());
    canon.push_str(scheme);
    canon.push(':');
    if let Some(user) = user {
        canon.push_str(&user);
        canon.push('@');
    }
    canon.push_str(&host);
    if let Some(port) = port.filter(|p| *p != DEFAULT_SIP_PORT) {
        canon.push(':');
        canon.push_str(&port.to_string());
    }
    Some(canon)
}

fn canonical_user(user: &str) -> Option<String> {
    let decoded = percent_decode_str(user).decode_utf8().ok()?;
    if decoded.chars().any(|c| c.is_control()) {
        return None;
    }
    Some(utf8_percent_encode(&decoded, USER_ESCAPE).to_string())
}

fn canonical_host(host: &str) -> Option<String> {
    if host.starts_with('[') {
        // IPv6 reference, validated by split_host_port
        return Some(host.to_owned());
    }
    let decoded = percent_decode_str(host).decode_utf8().ok()?;
    if decoded.is_empty() || decoded.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }
    if decoded.contains(['@', ':', '[', ']']) {
        return None;
    }
    Some(utf8_percent_encode(&decoded, HOST_ESCAPE).to_string())
}

/// Splits `host[:port]` or `[v6]:port`. IPv6 hosts keep their brackets.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if input.starts_with('[') {
        let end = input.find(']')?;
        let inner = &input[1..end];
        if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.') {
            return None;
        }
        let host = &input[..=end];
        let remainder = &input[end + 1..];
        if remainder.is_empty() {
            Some((host, None))
        } else {
            let port = remainder.strip_prefix(':')?.parse().ok()?;
            Some((host, Some(port)))
        }
    } else if let Some((host, port)) = input.split_once(':') {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some((host, Some(port.parse().ok()?)))
    } else {
        Some((input, None))
    }
}

/// Derives the alias used for a binding that has none yet.
///
/// Two independent 32-bit hashes over the AOR, the contact URI and the
/// public IP are rendered as 8 hex digits each. Collisions are not checked.
pub fn compute_alias(aor: &str, contact_uri: &str, public_ip: &str) -> String {
    let h1 = siphash(&(aor, contact_uri, public_ip)) as u32;
    let h2 = siphash(&(public_ip, contact_uri, aor)) as u32;
    format!("{:08x}{:08x}", h1, h2)
}
