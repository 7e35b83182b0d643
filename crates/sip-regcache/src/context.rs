// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! REGISTER request context: everything the cache needs from one request.

use smol_str::SmolStr;
use tracing::debug;

use crate::aor::canonicalize_aor;
use crate::error::{RegCacheError, Result};
use crate::types::{AliasEntry, Transport};

/// One entry of a Contact header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactValue {
    /// Contact URI without angle brackets or header parameters.
    pub uri: SmolStr,
    /// `expires` header parameter, if present.
    pub expires: Option<u32>,
}

impl ContactValue {
    pub fn new(uri: impl Into<SmolStr>, expires: Option<u32>) -> Self {
        Self {
            uri: uri.into(),
            expires,
        }
    }

    /// Parses `name-addr` or `addr-spec` followed by header parameters.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (uri, params) = split_uri_params(value)
            .ok_or_else(|| RegCacheError::MalformedContact(value.to_string()))?;

        let mut expires = None;
        for param in params.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, val) = param.split_once('=').unwrap_or((param, ""));
            if name.trim().eq_ignore_ascii_case("expires") {
                expires = Some(parse_expires(val)?);
            }
        }

        Ok(Self {
            uri: SmolStr::new(uri),
            expires,
        })
    }

    /// User part of the contact URI.
    pub fn user(&self) -> Option<&str> {
        uri_user(&self.uri)
    }
}

impl std::fmt::Display for ContactValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.uri)?;
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        Ok(())
    }
}

/// Parses an Expires header or `expires` parameter value. Values above
/// `u32::MAX` saturate.
pub fn parse_expires(value: &str) -> Result<u32> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RegCacheError::MalformedExpires(value.to_string()));
    }
    Ok(trimmed.parse::<u64>().map_or(u32::MAX, |v| v.min(u32::MAX as u64) as u32))
}

/// Splits a header value holding several comma-separated contacts. Commas
/// inside quotes or angle brackets do not separate.
pub fn split_contacts(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut start = 0;
    let mut escaped = false;

    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' if !in_brackets => in_quotes = !in_quotes,
            '<' if !in_quotes => in_brackets = true,
            '>' if !in_quotes => in_brackets = false,
            ',' if !in_quotes && !in_brackets => {
                parts.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// User part of a SIP URI (`sip:user[:password]@host`).
pub fn uri_user(uri: &str) -> Option<&str> {
    let (_, rest) = uri.split_once(':')?;
    let (userinfo, _) = rest.split_once('@')?;
    let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
    (!user.is_empty()).then_some(user)
}

/// Returns `(uri, header params)` of a contact or To/From value.
fn split_uri_params(value: &str) -> Option<(&str, &str)> {
    let (uri, params) = if let Some(start) = value.find('<') {
        let end = start + 1 + value[start + 1..].find('>')?;
        (&value[start + 1..end], &value[end + 1..])
    } else {
        // without brackets every ';' starts a header parameter
        match value.find(';') {
            Some(pos) => (&value[..pos], &value[pos..]),
            None => (value, ""),
        }
    };

    let uri = uri.trim();
    if uri.is_empty() || !uri.contains(':') || uri.contains(char::is_whitespace) {
        return None;
    }
    Some((uri, params))
}

/// Everything the cache needs from one REGISTER request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterContext {
    /// Canonical AOR taken from the To header.
    pub aor: SmolStr,
    pub contacts: Vec<ContactValue>,
    /// The request carried `Contact: *`.
    pub wildcard: bool,
    pub expires_header: Option<u32>,
    pub source_ip: SmolStr,
    pub source_port: u16,
    pub transport: Transport,
    pub local_interface: u16,
    pub user_agent: SmolStr,
}

impl RegisterContext {
    pub fn builder(to: impl Into<String>) -> RegisterContextBuilder {
        RegisterContextBuilder::new(to)
    }

    /// A REGISTER without Contact only queries the current bindings.
    pub fn is_query(&self) -> bool {
        self.contacts.is_empty() && !self.wildcard
    }

    /// Expiry requested for `contact`: its own parameter, else the Expires
    /// header, else `default`.
    pub fn requested_expires(&self, contact: &ContactValue, default: Option<u32>) -> Option<u32> {
        contact.expires.or(self.expires_header).or(default)
    }

    /// Alias entry fields describing `contact_uri` as seen in this request.
    pub fn alias_fields(&self, contact_uri: &str) -> AliasEntry {
        AliasEntry::new(
            self.aor.clone(),
            contact_uri,
            self.source_ip.clone(),
            self.source_port,
        )
        .with_transport(self.transport)
        .with_local_interface(self.local_interface)
        .with_user_agent(self.user_agent.clone())
    }
}

/// Collects raw header values; [`build`](Self::build) validates them.
#[derive(Debug, Clone, Default)]
pub struct RegisterContextBuilder {
    to: String,
    contacts: Vec<String>,
    expires_header: Option<String>,
    source_ip: SmolStr,
    source_port: u16,
    transport: Transport,
    local_interface: u16,
    user_agent: SmolStr,
}

impl RegisterContextBuilder {
    pub fn new(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            ..Self::default()
        }
    }

    /// Adds one Contact header value; it may hold several contacts.
    pub fn contact(mut self, value: impl Into<String>) -> Self {
        self.contacts.push(value.into());
        self
    }

    pub fn expires(mut self, value: impl Into<String>) -> Self {
        self.expires_header = Some(value.into());
        self
    }

    pub fn source(mut self, ip: impl Into<SmolStr>, port: u16) -> Self {
        self.source_ip = ip.into();
        self.source_port = port;
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn local_interface(mut self, local_interface: u16) -> Self {
        self.local_interface = local_interface;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<SmolStr>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> Result<RegisterContext> {
        let to_uri = split_uri_params(self.to.trim()).map_or(self.to.as_str(), |(uri, _)| uri);
        let aor = canonicalize_aor(to_uri).ok_or_else(|| {
            debug!(to = %self.to, "could not canonicalize AOR");
            RegCacheError::EmptyAor
        })?;

        if self.source_ip.is_empty() {
            return Err(RegCacheError::MissingField("source_ip"));
        }

        let expires_header = self
            .expires_header
            .as_deref()
            .map(parse_expires)
            .transpose()?;

        let mut contacts = Vec::new();
        let mut wildcard = false;
        for value in &self.contacts {
            for part in split_contacts(value) {
                if part == "*" {
                    wildcard = true;
                } else {
                    contacts.push(ContactValue::parse(part)?);
                }
            }
        }

        if wildcard {
            if !contacts.is_empty() {
                return Err(RegCacheError::MalformedContact(
                    "'*' mixed with other contacts".to_string(),
                ));
            }
            if expires_header != Some(0) {
                return Err(RegCacheError::MalformedExpires(
                    "'*' requires Expires: 0".to_string(),
                ));
            }
        }

        Ok(RegisterContext {
            aor: SmolStr::new(aor),
            contacts,
            wildcard,
            expires_header,
            source_ip: self.source_ip,
            source_port: self.source_port,
            transport: self.transport,
            local_interface: self.local_interface,
            user_agent: self.user_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_addr_with_expires() {
        let contact = ContactValue::parse("\"Alice\" <sip:alice@10.0.0.5:5060;transport=udp>;expires=600;q=0.5").unwrap();
        assert_eq!(contact.uri, "sip:alice@10.0.0.5:5060;transport=udp");
        assert_eq!(contact.expires, Some(600));
        assert_eq!(contact.user(), Some("alice"));
    }

    #[test]
    fn parses_addr_spec_without_brackets() {
        let contact = ContactValue::parse("sip:alice@10.0.0.5;EXPIRES=30").unwrap();
        assert_eq!(contact.uri, "sip:alice@10.0.0.5");
        assert_eq!(contact.expires, Some(30));
    }

    #[test]
    fn rejects_malformed_contacts() {
        assert!(matches!(
            ContactValue::parse("<sip:alice@10.0.0.5"),
            Err(RegCacheError::MalformedContact(_))
        ));
        assert!(matches!(
            ContactValue::parse("alice"),
            Err(RegCacheError::MalformedContact(_))
        ));
        assert!(matches!(
            ContactValue::parse("<sip:alice@10.0.0.5>;expires=soon"),
            Err(RegCacheError::MalformedExpires(_))
        ));
    }

    #[test]
    fn expires_saturates() {
        assert_eq!(parse_expires("99999999999").unwrap(), u32::MAX);
        assert_eq!(parse_expires(" 60 ").unwrap(), 60);
        assert!(parse_expires("-1").is_err());
        assert!(parse_expires("").is_err());
    }

    #[test]
    fn splits_contact_lists() {
        let parts = split_contacts("<sip:a@h1>;expires=1, \"B, jr\" <sip:b@h2>,sip:c@h3");
        assert_eq!(parts, vec!["<sip:a@h1>;expires=1", "\"B, jr\" <sip:b@h2>", "sip:c@h3"]);
    }

    #[test]
    fn builds_context() {
        let ctx = RegisterContext::builder("\"Alice\" <sip:Alice@Example.com:5060>;tag=abc")
            .contact("<sip:alice@10.0.0.5>;expires=600, <sip:alice@10.0.0.6>")
            .expires("3600")
            .source("192.0.2.1", 5062)
            .transport(Transport::Tcp)
            .user_agent("phone/1.0")
            .build()
            .unwrap();

        assert_eq!(ctx.aor, "sip:Alice@Example.com");
        assert_eq!(ctx.contacts.len(), 2);
        assert!(!ctx.is_query());
        assert_eq!(ctx.requested_expires(&ctx.contacts[0], None), Some(600));
        assert_eq!(ctx.requested_expires(&ctx.contacts[1], None), Some(3600));

        let fields = ctx.alias_fields("sip:alice@10.0.0.5");
        assert_eq!(fields.source_port, 5062);
        assert_eq!(fields.transport, Transport::Tcp);
        assert_eq!(fields.remote_user_agent, "phone/1.0");
    }

    #[test]
    fn query_and_wildcard() {
        let query = RegisterContext::builder("sip:alice@example.com")
            .source("192.0.2.1", 5060)
            .build()
            .unwrap();
        assert!(query.is_query());

        let wildcard = RegisterContext::builder("sip:alice@example.com")
            .contact("*")
            .expires("0")
            .source("192.0.2.1", 5060)
            .build()
            .unwrap();
        assert!(wildcard.wildcard);
        assert!(!wildcard.is_query());

        let bad = RegisterContext::builder("sip:alice@example.com")
            .contact("*")
            .expires("60")
            .source("192.0.2.1", 5060)
            .build();
        assert!(matches!(bad, Err(RegCacheError::MalformedExpires(_))));
    }

    #[test]
    fn rejects_bad_aor() {
        let err = RegisterContext::builder("tel:+15551234567")
            .source("192.0.2.1", 5060)
            .build()
            .unwrap_err();
        assert_eq!(err, RegCacheError::EmptyAor);
    }
}
