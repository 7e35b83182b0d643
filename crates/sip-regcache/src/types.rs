// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;
use std::collections::HashMap;
use std::fmt;

/// SIP transport a device registered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
        }
    }

    /// Parses a `transport=` parameter value, case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "udp" => Some(Transport::Udp),
            "tcp" => Some(Transport::Tcp),
            "tls" => Some(Transport::Tls),
            "ws" => Some(Transport::Ws),
            "wss" => Some(Transport::Wss),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registrar-side view of one contact registered under an AOR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Unique id used as contact user toward the registrar.
    pub alias: SmolStr,

    /// Absolute timestamp (seconds) at which the registrar expires the
    /// binding. Zero means the binding was never confirmed upstream.
    pub registrar_expire: i64,
}

/// Key of a binding inside its AOR entry: one binding per contact URI and
/// source IP. Renders as `contact-uri/source-ip`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub contact_uri: SmolStr,
    pub source_ip: SmolStr,
}

impl BindingKey {
    pub fn new(contact_uri: impl Into<SmolStr>, source_ip: impl Into<SmolStr>) -> Self {
        Self {
            contact_uri: contact_uri.into(),
            source_ip: source_ip.into(),
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.contact_uri, self.source_ip)
    }
}

/// All bindings of one canonical AOR. Never stored empty.
pub type AorEntry = HashMap<BindingKey, Binding>;

/// Device-side state saved for an alias: where the device really is and
/// until when it believes it is registered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AliasEntry {
    pub aor: SmolStr,
    pub contact_uri: SmolStr,
    pub alias: SmolStr,

    // saved state for NAT handling
    pub source_ip: SmolStr,
    pub source_port: u16,
    pub transport: Transport,

    /// Sticky local interface the device talks to.
    pub local_interface: u16,

    pub remote_user_agent: SmolStr,

    /// Absolute timestamp (seconds) at which the device considers itself
    /// expired.
    pub ua_expire: i64,
}

impl AliasEntry {
    pub fn new(
        aor: impl Into<SmolStr>,
        contact_uri: impl Into<SmolStr>,
        source_ip: impl Into<SmolStr>,
        source_port: u16,
    ) -> Self {
        Self {
            aor: aor.into(),
            contact_uri: contact_uri.into(),
            source_ip: source_ip.into(),
            source_port,
            ..Self::default()
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_local_interface(mut self, local_interface: u16) -> Self {
        self.local_interface = local_interface;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<SmolStr>) -> Self {
        self.remote_user_agent = user_agent.into();
        self
    }

    pub fn with_ua_expire(mut self, ua_expire: i64) -> Self {
        self.ua_expire = ua_expire;
        self
    }

    pub fn binding_key(&self) -> BindingKey {
        BindingKey::new(self.contact_uri.clone(), self.source_ip.clone())
    }

    pub fn contact_key(&self) -> ContactKey {
        ContactKey::new(
            self.contact_uri.clone(),
            self.source_ip.clone(),
            self.source_port,
        )
    }
}

/// Key of the reverse contact index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContactKey {
    pub contact_uri: SmolStr,
    pub source_ip: SmolStr,
    pub source_port: u16,
}

impl ContactKey {
    pub fn new(
        contact_uri: impl Into<SmolStr>,
        source_ip: impl Into<SmolStr>,
        source_port: u16,
    ) -> Self {
        Self {
            contact_uri: contact_uri.into(),
            source_ip: source_ip.into(),
            source_port,
        }
    }
}
