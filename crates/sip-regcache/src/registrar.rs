// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! REGISTER processing on top of the cache.
//!
//! Two paths are provided:
//!
//! - **Register caching**: contacts are rewritten to their alias and forwarded
//!   upstream with [`RegisterCache::prepare_forward`]; the registrar's 2xx is
//!   folded back into the cache with [`RegisterCache::apply_registrar_reply`].
//! - **Local registrar**: [`RegisterCache::save_single_contact`] answers the
//!   REGISTER itself for a single contact.

use smol_str::SmolStr;
use std::fmt;
use tracing::{debug, info, warn};

use crate::aor::compute_alias;
use crate::cache::RegisterCache;
use crate::config::DEFAULT_REG_EXPIRES;
use crate::context::{split_contacts, ContactValue, RegisterContext};
use crate::error::{RegCacheError, Result};

/// Contact rendered toward the device in a 2xx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContact {
    pub uri: SmolStr,
    pub expires: u32,
}

impl fmt::Display for ReplyContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>;expires={}", self.uri, self.expires)
    }
}

/// Contact as sent to the upstream registrar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardContact {
    /// Contact as received from the device.
    pub original: ContactValue,
    pub alias: SmolStr,
    /// Rewritten URI: the alias as user part at the server's own address.
    pub uri: SmolStr,
    /// Expiry the device asked for.
    pub requested: Option<u32>,
    /// Expiry requested from the registrar.
    pub expires: Option<u32>,
}

impl fmt::Display for ForwardContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.uri)?;
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        Ok(())
    }
}

/// Contact set of a 2xx received from the registrar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrarReply {
    pub contacts: Vec<ContactValue>,
    pub expires_header: Option<u32>,
}

impl RegistrarReply {
    pub fn new(contacts: Vec<ContactValue>, expires_header: Option<u32>) -> Self {
        Self {
            contacts,
            expires_header,
        }
    }

    /// Parses the Contact header values of a reply. Contacts that cannot be
    /// parsed are skipped.
    pub fn parse<'a>(
        contact_values: impl IntoIterator<Item = &'a str>,
        expires_header: Option<&str>,
    ) -> Result<Self> {
        let expires_header = expires_header
            .map(crate::context::parse_expires)
            .transpose()?;
        let contacts = contact_values
            .into_iter()
            .flat_map(split_contacts)
            .filter_map(|value| match ContactValue::parse(value) {
                Ok(contact) => Some(contact),
                Err(err) => {
                    debug!(%err, "skipping registrar contact");
                    None
                }
            })
            .collect();
        Ok(Self {
            contacts,
            expires_header,
        })
    }

    /// Expiry the registrar granted to the contact using `alias` as user
    /// part; `None` if the contact is not listed.
    fn granted(&self, alias: &str) -> Option<Option<u32>> {
        self.contacts
            .iter()
            .find(|c| c.user() == Some(alias))
            .map(|c| c.expires.or(self.expires_header))
    }
}

impl RegisterCache {
    /// Alias a contact registered from `ctx` uses: the stored one if any,
    /// else a freshly derived one.
    pub fn alias_for(&self, ctx: &RegisterContext, contact_uri: &str) -> SmolStr {
        self.get_alias(&ctx.aor, contact_uri, &ctx.source_ip)
            .map(|binding| binding.alias)
            .unwrap_or_else(|| SmolStr::new(compute_alias(&ctx.aor, contact_uri, &ctx.source_ip)))
    }

    /// Rewrites the contacts of `ctx` for forwarding to the registrar.
    ///
    /// `contact_host` is the `host[:port]` the registrar should send requests
    /// for these contacts to.
    pub fn prepare_forward(&self, ctx: &RegisterContext, contact_host: &str) -> Vec<ForwardContact> {
        let config = self.config();
        ctx.contacts
            .iter()
            .map(|contact| {
                let alias = self.alias_for(ctx, &contact.uri);
                let scheme = contact.uri.split_once(':').map_or("sip", |(s, _)| s);
                let requested = ctx.requested_expires(contact, config.default_expires);
                ForwardContact {
                    original: contact.clone(),
                    uri: SmolStr::new(format!("{}:{}@{}", scheme, alias, contact_host)),
                    alias,
                    requested,
                    expires: requested.map(|r| config.registrar_expires(r)),
                }
            })
            .collect()
    }

    /// Folds a 2xx from the registrar into the cache.
    ///
    /// Forwarded contacts the registrar confirmed are saved; those it no
    /// longer lists (or confirmed with expires 0) are removed. Returns the
    /// contacts to render toward the device.
    pub fn apply_registrar_reply(
        &self,
        ctx: &RegisterContext,
        forwarded: &[ForwardContact],
        reply: &RegistrarReply,
        now: i64,
    ) -> Vec<ReplyContact> {
        if ctx.wildcard {
            let removed = self.remove_aor(&ctx.aor);
            info!(aor = %ctx.aor, removed, "unregistered all contacts");
            return Vec::new();
        }

        let mut contacts = Vec::with_capacity(forwarded.len());
        for fwd in forwarded {
            let granted = reply
                .granted(&fwd.alias)
                .map(|expires| expires.or(fwd.expires).unwrap_or(0));

            match granted {
                Some(expires) if expires > 0 => {
                    let ua_expires = self
                        .config()
                        .ua_expires(fwd.requested.unwrap_or(expires))
                        .min(expires);
                    let registrar_expire = now + i64::from(expires);
                    let fields = ctx
                        .alias_fields(&fwd.original.uri)
                        .with_ua_expire(now + i64::from(ua_expires));

                    match self.update(&fwd.alias, registrar_expire, fields) {
                        Ok(()) => {
                            info!(
                                aor = %ctx.aor,
                                contact = %fwd.original.uri,
                                alias = %fwd.alias,
                                expires,
                                ua_expires,
                                "registration saved"
                            );
                            contacts.push(ReplyContact {
                                uri: fwd.original.uri.clone(),
                                expires: ua_expires,
                            });
                        }
                        Err(err) => {
                            warn!(aor = %ctx.aor, alias = %fwd.alias, %err, "could not save registration");
                        }
                    }
                }
                _ => {
                    if self.remove(&ctx.aor, &fwd.original.uri, &fwd.alias) {
                        info!(aor = %ctx.aor, contact = %fwd.original.uri, "registration removed");
                    }
                }
            }
        }
        contacts
    }

    /// Handles a REGISTER locally for at most one contact.
    ///
    /// Returns the contacts currently bound to the AOR.
    pub fn save_single_contact(&self, ctx: &RegisterContext, now: i64) -> Result<Vec<ReplyContact>> {
        if ctx.is_query() {
            return Ok(self.current_contacts(&ctx.aor, now));
        }
        if ctx.wildcard {
            let removed = self.remove_aor(&ctx.aor);
            info!(aor = %ctx.aor, removed, "unregistered all contacts");
            return Ok(Vec::new());
        }

        let [contact] = ctx.contacts.as_slice() else {
            return Err(RegCacheError::TooManyContacts(ctx.contacts.len()));
        };

        let config = self.config();
        let alias = self.alias_for(ctx, &contact.uri);
        let requested = ctx
            .requested_expires(contact, config.default_expires)
            .unwrap_or(DEFAULT_REG_EXPIRES);

        if requested == 0 {
            self.remove(&ctx.aor, &contact.uri, &alias);
            info!(aor = %ctx.aor, contact = %contact.uri, "contact unregistered");
            return Ok(self.current_contacts(&ctx.aor, now));
        }

        let expires = config.ua_expires(requested);
        let expire = now + i64::from(expires);
        self.update(&alias, expire, ctx.alias_fields(&contact.uri).with_ua_expire(expire))?;
        info!(aor = %ctx.aor, contact = %contact.uri, %alias, expires, "contact registered");

        Ok(self.current_contacts(&ctx.aor, now))
    }

    /// Unexpired bindings of `aor` with their remaining lifetime.
    pub fn current_contacts(&self, aor: &str, now: i64) -> Vec<ReplyContact> {
        self.aor_bindings(aor)
            .into_iter()
            .filter(|(_, binding)| binding.registrar_expire > now)
            .map(|(key, binding)| ReplyContact {
                uri: key.contact_uri,
                expires: u32::try_from(binding.registrar_expire - now).unwrap_or(u32::MAX),
            })
            .collect()
    }
}
