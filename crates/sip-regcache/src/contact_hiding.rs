// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Contact hiding: the device's real user/host/port travel inside the user
//! part of the contact sent upstream, so nothing has to be cached.

use std::collections::BTreeMap;

use crate::alias_codec::{self, AliasValue};

const USER_KEY: &str = "u";
const HOST_KEY: &str = "h";
const PORT_KEY: &str = "p";

/// Contact recovered from a hidden user part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HiddenContact {
    pub user: String,
    pub host: String,
    pub port: String,
    /// Extra variables stored alongside the address.
    pub vars: BTreeMap<String, String>,
}

/// Parses `k=v;k=v`. Items without exactly one `=` are ignored.
pub fn parse_vars(vars: &str) -> BTreeMap<String, String> {
    vars.split(';')
        .filter_map(|item| {
            let mut parts = item.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(k), Some(v), None) if !k.trim().is_empty() => {
                    Some((k.trim().to_string(), v.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

/// Encodes the device address and `vars` into a user part starting with
/// `prefix`.
///
/// ```
/// use sip_regcache::contact_hiding::{hide_contact, reveal_contact};
///
/// let user = hide_contact("alice", "10.0.0.5", "5060", "si=192.0.2.1;st=udp", "sbc-");
/// assert!(user.starts_with("sbc-"));
///
/// let contact = reveal_contact(&user, "sbc-").unwrap();
/// assert_eq!(contact.host, "10.0.0.5");
/// assert_eq!(contact.vars["st"], "udp");
/// ```
pub fn hide_contact(user: &str, host: &str, port: &str, vars: &str, prefix: &str) -> String {
    let mut fields: BTreeMap<String, AliasValue> = parse_vars(vars)
        .into_iter()
        .map(|(k, v)| (k, AliasValue::Str(v)))
        .collect();
    fields.insert(USER_KEY.to_string(), AliasValue::from(user));
    fields.insert(HOST_KEY.to_string(), AliasValue::from(host));
    fields.insert(PORT_KEY.to_string(), AliasValue::from(port));

    let encoded = alias_codec::encode(&AliasValue::Struct(fields));
    tracing::debug!(encoded = %encoded, "contact variables");
    format!("{}{}", prefix, encoded)
}

/// Reverses [`hide_contact`]. Returns `None` if `user_part` does not carry
/// the prefix or does not decode into a contact.
pub fn reveal_contact(user_part: &str, prefix: &str) -> Option<HiddenContact> {
    let encoded = user_part.strip_prefix(prefix)?;
    let value = match alias_codec::decode(encoded) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(%err, user = user_part, "not a hidden contact");
            return None;
        }
    };

    let mut fields = match value {
        AliasValue::Struct(fields) => fields,
        _ => return None,
    };
    let mut take = |key: &str| match fields.remove(key) {
        Some(AliasValue::Str(s)) => Some(s),
        _ => None,
    };
    let user = take(USER_KEY).unwrap_or_default();
    let host = take(HOST_KEY)?;
    let port = take(PORT_KEY).unwrap_or_default();

    let vars = fields
        .into_iter()
        .filter_map(|(k, v)| match v {
            AliasValue::Str(s) => Some((k, s)),
            _ => None,
        })
        .collect();

    Some(HiddenContact {
        user,
        host,
        port,
        vars,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_address_and_vars() {
        let user = hide_contact("alice", "10.0.0.5", "5062", "si=192.0.2.1;sp=5060;st=tcp", "");
        assert!(user.chars().all(alias_codec::is_encoded_char));

        let contact = reveal_contact(&user, "").unwrap();
        assert_eq!(contact.user, "alice");
        assert_eq!(contact.host, "10.0.0.5");
        assert_eq!(contact.port, "5062");
        assert_eq!(contact.vars.len(), 3);
        assert_eq!(contact.vars["sp"], "5060");
    }

    #[test]
    fn address_wins_over_vars() {
        let user = hide_contact("alice", "10.0.0.5", "", "h=evil.example.com", "p-");
        assert_eq!(reveal_contact(&user, "p-").unwrap().host, "10.0.0.5");
    }

    #[test]
    fn ignores_malformed_vars() {
        let vars = parse_vars("a=1;;b;c=2=3; d = 4 ");
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["a"], "1");
        assert_eq!(vars["d"], "4");
    }

    #[test]
    fn reveal_rejects_foreign_users() {
        assert_eq!(reveal_contact("alice", "sbc-"), None);
        assert_eq!(reveal_contact("sbc-garbage", "sbc-"), None);
        assert_eq!(reveal_contact("sbc-s5/hello", "sbc-"), None);
    }

    #[test]
    fn empty_user_is_allowed() {
        let user = hide_contact("", "10.0.0.5", "5060", "", "");
        let contact = reveal_contact(&user, "").unwrap();
        assert_eq!(contact.user, "");
        assert!(contact.vars.is_empty());
    }
}
