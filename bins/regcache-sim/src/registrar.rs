//! In-memory upstream registrar the simulation forwards REGISTERs to.

use dashmap::DashMap;
use sip_regcache::{ContactValue, ForwardContact, RegistrarReply};
use smol_str::SmolStr;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredBinding {
    contact: SmolStr,
    expires_at: i64,
}

/// Location store keyed by AOR, answering like a plain RFC 3261 registrar.
#[derive(Clone)]
pub struct MockRegistrar {
    inner: Arc<DashMap<SmolStr, Vec<StoredBinding>>>,
    max_expires: u32,
}

impl MockRegistrar {
    pub fn new(max_expires: u32) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            max_expires,
        }
    }

    /// Applies a REGISTER and returns the 2xx contact set.
    pub fn register(
        &self,
        aor: &str,
        wildcard: bool,
        contacts: &[ForwardContact],
        now: i64,
    ) -> RegistrarReply {
        if wildcard {
            self.inner.remove(aor);
            return RegistrarReply::default();
        }

        let reply = {
            let mut list = self.inner.entry(SmolStr::new(aor)).or_default();
            list.retain(|b| b.expires_at > now);

            for contact in contacts {
                // Remove existing binding with same contact
                list.retain(|b| b.contact != contact.uri);
                let expires = contact.expires.unwrap_or(3600).min(self.max_expires);
                if expires > 0 {
                    list.push(StoredBinding {
                        contact: contact.uri.clone(),
                        expires_at: now + i64::from(expires),
                    });
                }
            }

            let listed = list
                .iter()
                .map(|b| ContactValue::new(b.contact.clone(), Some((b.expires_at - now) as u32)))
                .collect();
            RegistrarReply::new(listed, None)
        };

        self.inner.remove_if(aor, |_, list| list.is_empty());
        reply
    }

    /// Bindings still valid at `now`.
    pub fn binding_count(&self, now: i64) -> usize {
        self.inner
            .iter()
            .map(|entry| entry.iter().filter(|b| b.expires_at > now).count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(uri: &str, expires: Option<u32>) -> ForwardContact {
        ForwardContact {
            original: ContactValue::new("sip:dev@10.0.0.1", expires),
            alias: SmolStr::new("alias"),
            uri: SmolStr::new(uri),
            requested: expires,
            expires,
        }
    }

    #[test]
    fn grants_capped_expiry() {
        let registrar = MockRegistrar::new(600);
        let reply = registrar.register(
            "sip:alice@example.com",
            false,
            &[forward("sip:a1@proxy", Some(3600))],
            100,
        );
        assert_eq!(reply.contacts, vec![ContactValue::new("sip:a1@proxy", Some(600))]);
        assert_eq!(registrar.binding_count(100), 1);
        assert_eq!(registrar.binding_count(700), 0);
    }

    #[test]
    fn unregister_drops_aor() {
        let registrar = MockRegistrar::new(600);
        registrar.register("sip:alice@example.com", false, &[forward("sip:a1@proxy", Some(60))], 0);
        let reply = registrar.register("sip:alice@example.com", false, &[forward("sip:a1@proxy", Some(0))], 1);
        assert!(reply.contacts.is_empty());
        assert!(registrar.inner.is_empty());
    }
}
