// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The registration engine.
//!
//! Three indices share the work:
//!
//! - **AOR index**: canonical AOR → [`AorEntry`] (contact/IP → [`Binding`])
//! - **Alias index**: alias → [`AliasEntry`]
//! - **Contact index**: (contact URI, source IP, source port) → alias
//!
//! Operations touching several indices lock buckets in the order
//! AOR → Alias → Contact and never hold two buckets of the same index at
//! once. Storage handler callbacks run after every lock is released.

use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RegCacheConfig;
use crate::error::{RegCacheError, Result};
use crate::metrics::RegCacheMetrics;
use crate::sharded::ShardedTable;
use crate::storage::{NoopStorageHandler, RegCacheStorageHandler};
use crate::types::{AliasEntry, AorEntry, Binding, BindingKey, ContactKey};

/// Entry counts of the three indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegCacheStats {
    pub aors: usize,
    pub bindings: usize,
    pub aliases: usize,
    pub contacts: usize,
}

/// A binding removed from the cache, reported to the storage handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemovedBinding {
    pub aor: SmolStr,
    pub contact_uri: SmolStr,
    pub alias: SmolStr,
}

/// Work left over by `update` once its locks are released.
enum Cleanup {
    /// Another alias owned the contact triple; drop it entirely.
    DisplacedAlias(SmolStr),
    /// The alias moved to another AOR; drop its old binding only.
    MovedBinding { aor: SmolStr, key: BindingKey, alias: SmolStr },
}

pub struct RegisterCache {
    config: RegCacheConfig,
    pub(crate) aor_index: ShardedTable<SmolStr, AorEntry>,
    pub(crate) alias_index: ShardedTable<SmolStr, AliasEntry>,
    pub(crate) contact_index: ShardedTable<ContactKey, SmolStr>,
    storage: Arc<dyn RegCacheStorageHandler>,
    metrics: RegCacheMetrics,
}

impl RegisterCache {
    pub fn new(config: RegCacheConfig) -> Self {
        Self::with_storage_handler(config, Arc::new(NoopStorageHandler))
    }

    pub fn with_storage_handler(
        config: RegCacheConfig,
        storage: Arc<dyn RegCacheStorageHandler>,
    ) -> Self {
        let size = config.effective_bucket_count();
        Self {
            config,
            aor_index: ShardedTable::new(size),
            alias_index: ShardedTable::new(size),
            contact_index: ShardedTable::new(size),
            storage,
            metrics: RegCacheMetrics::new(),
        }
    }

    pub fn config(&self) -> &RegCacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RegCacheMetrics {
        &self.metrics
    }

    pub(crate) fn storage(&self) -> &dyn RegCacheStorageHandler {
        self.storage.as_ref()
    }

    /// Number of buckets per index.
    pub fn bucket_count(&self) -> usize {
        self.aor_index.size()
    }

    /// Returns a copy of the binding of `contact_uri` registered from
    /// `public_ip` under the canonical `aor`.
    pub fn get_alias(&self, aor: &str, contact_uri: &str, public_ip: &str) -> Option<Binding> {
        if aor.is_empty() {
            debug!("canonical AOR is empty");
            return None;
        }
        let key = BindingKey::new(contact_uri, public_ip);
        let aors = self.aor_index.bucket_for(aor).lock();
        aors.get(aor)?.get(&key).cloned()
    }

    /// Creates or refreshes the binding described by `fields` under `alias`.
    ///
    /// All index mutations commit before any lock is released. A binding
    /// already stored for the same contact and IP under another alias is
    /// reported as [`RegCacheError::AliasMismatch`] and nothing is written.
    pub fn update(&self, alias: &str, registrar_expire: i64, fields: AliasEntry) -> Result<()> {
        let mut entry = fields;
        entry.alias = SmolStr::new(alias);
        validate(&entry)?;

        if self.config.max_ua_expires.is_some()
            && registrar_expire > 0
            && entry.ua_expire > registrar_expire
        {
            entry.ua_expire = registrar_expire;
        }

        let key = entry.binding_key();
        let ckey = entry.contact_key();
        let mut cleanup = Vec::new();

        {
            let mut aors = self.aor_index.bucket_for(&entry.aor).lock();

            if let Some(stored) = aors.get(&entry.aor).and_then(|e| e.get(&key)) {
                if stored.alias != entry.alias {
                    warn!(
                        aor = %entry.aor,
                        binding = %key,
                        stored = %stored.alias,
                        requested = %entry.alias,
                        "used alias is different from stored one"
                    );
                    self.metrics.record_alias_mismatch();
                    return Err(RegCacheError::AliasMismatch {
                        stored: stored.alias.clone(),
                        requested: entry.alias.clone(),
                    });
                }
            }

            let mut aliases = self.alias_index.bucket_for(&entry.alias).lock();

            let aor_entry = aors.entry(entry.aor.clone()).or_insert_with(|| {
                debug!(aor = %entry.aor, "inserted new AOR");
                AorEntry::new()
            });
            match aor_entry.get_mut(&key) {
                Some(binding) => {
                    debug!(binding = %key, alias = %binding.alias, "updating existing binding");
                    binding.registrar_expire = registrar_expire;
                }
                None => {
                    debug!(binding = %key, alias = %entry.alias, "inserted new binding");
                    aor_entry.insert(
                        key.clone(),
                        Binding {
                            alias: entry.alias.clone(),
                            registrar_expire,
                        },
                    );
                }
            }
            // one binding per alias
            aor_entry.retain(|k, b| *k == key || b.alias != entry.alias);

            let previous = aliases.insert(entry.alias.clone(), entry.clone());

            {
                let mut contacts = self.contact_index.bucket_for(&ckey).lock();
                if let Some(other) = contacts.insert(ckey.clone(), entry.alias.clone()) {
                    if other != entry.alias {
                        debug!(contact = %ckey.contact_uri, old = %other, new = %entry.alias, "contact moved to new alias");
                        cleanup.push(Cleanup::DisplacedAlias(other));
                    }
                }
            }

            if let Some(previous) = previous {
                let old_ckey = previous.contact_key();
                if old_ckey != ckey {
                    // NAT rebinding: the old triple must not resolve anymore
                    let mut contacts = self.contact_index.bucket_for(&old_ckey).lock();
                    if contacts.get(&old_ckey) == Some(&entry.alias) {
                        contacts.remove(&old_ckey);
                    }
                }
                if previous.aor != entry.aor {
                    cleanup.push(Cleanup::MovedBinding {
                        aor: previous.aor.clone(),
                        key: previous.binding_key(),
                        alias: entry.alias.clone(),
                    });
                }
            }
        }

        self.metrics.record_update();
        self.storage
            .on_update(&entry.aor, &entry.alias, registrar_expire, &entry);

        for job in cleanup {
            match job {
                Cleanup::DisplacedAlias(other) => {
                    self.remove_alias(&other);
                }
                Cleanup::MovedBinding { aor, key, alias } => {
                    self.remove_moved_binding(&aor, &key, &alias);
                }
            }
        }
        Ok(())
    }

    /// Changes the device-side expiry of an existing alias.
    ///
    /// Returns `false` if the alias is unknown; the caller must then fall back
    /// to a full registration.
    pub fn update_alias_expires(&self, alias: &str, ua_expire: i64) -> bool {
        {
            let mut aliases = self.alias_index.bucket_for(alias).lock();
            match aliases.get_mut(alias) {
                Some(entry) => entry.ua_expire = ua_expire,
                None => return false,
            }
        }
        self.storage.on_update_expires(alias, ua_expire);
        true
    }

    /// Puts back `previous` as device-side expiry if the alias still carries
    /// `written`. A concurrent writer that changed it in between wins.
    pub(crate) fn restore_alias_expires(&self, alias: &str, written: i64, previous: i64) -> bool {
        {
            let mut aliases = self.alias_index.bucket_for(alias).lock();
            match aliases.get_mut(alias) {
                Some(entry) if entry.ua_expire == written => entry.ua_expire = previous,
                _ => return false,
            }
        }
        self.storage.on_update_expires(alias, previous);
        true
    }

    /// Removes one binding together with its alias and contact entries.
    ///
    /// Returns `true` if anything was removed.
    pub fn remove(&self, aor: &str, contact_uri: &str, alias: &str) -> bool {
        if aor.is_empty() {
            debug!("canonical AOR is empty");
            return false;
        }
        debug!(aor, contact = contact_uri, alias, "removing entries");

        let removed = {
            let mut aors = self.aor_index.bucket_for(aor).lock();
            let mut removed_binding = false;
            if let Some(aor_entry) = aors.get_mut(aor) {
                let before = aor_entry.len();
                aor_entry.retain(|k, b| !(k.contact_uri == contact_uri && b.alias == alias));
                removed_binding = aor_entry.len() != before;
                if aor_entry.is_empty() {
                    debug!(aor, "delete empty AOR");
                    aors.remove(aor);
                }
            }

            let removed_alias = self
                .remove_alias_entry_locked(alias, |e| e.aor == aor && e.contact_uri == contact_uri);
            removed_binding || removed_alias
        };

        if removed {
            self.metrics.record_removals(1);
            self.storage.on_delete(aor, contact_uri, alias);
        }
        removed
    }

    /// Removes every binding of `aor` and returns how many were removed.
    pub fn remove_aor(&self, aor: &str) -> usize {
        if aor.is_empty() {
            debug!("canonical AOR is empty");
            return 0;
        }

        let removed: Vec<RemovedBinding> = {
            let mut aors = self.aor_index.bucket_for(aor).lock();
            let Some(aor_entry) = aors.remove(aor) else {
                return 0;
            };
            aor_entry
                .into_iter()
                .map(|(key, binding)| {
                    self.remove_alias_entry_locked(&binding.alias, |e| e.aor == aor);
                    RemovedBinding {
                        aor: SmolStr::new(aor),
                        contact_uri: key.contact_uri,
                        alias: binding.alias,
                    }
                })
                .collect()
        };

        info!(aor, count = removed.len(), "removed all bindings");
        self.metrics.record_removals(removed.len());
        for r in &removed {
            self.storage.on_delete(&r.aor, &r.contact_uri, &r.alias);
        }
        removed.len()
    }

    /// Removes an alias, its binding and its contact entry, whatever AOR it
    /// belongs to.
    pub fn remove_alias(&self, alias: &str) -> bool {
        let Some(aor) = self.find_alias_entry(alias).map(|e| e.aor) else {
            return false;
        };

        let removed = {
            let mut aors = self.aor_index.bucket_for(&aor).lock();
            let mut aliases = self.alias_index.bucket_for(alias).lock();
            match aliases.get(alias) {
                // moved to another AOR meanwhile
                Some(entry) if entry.aor != aor => return false,
                None => return false,
                Some(_) => {}
            }
            let Some(entry) = aliases.remove(alias) else {
                return false;
            };
            if let Some(aor_entry) = aors.get_mut(&aor) {
                aor_entry.retain(|_, b| b.alias != alias);
                if aor_entry.is_empty() {
                    aors.remove(&aor);
                }
            }
            let ckey = entry.contact_key();
            let mut contacts = self.contact_index.bucket_for(&ckey).lock();
            if contacts.get(&ckey).map(|a| a.as_str()) == Some(alias) {
                contacts.remove(&ckey);
            }
            entry
        };

        self.metrics.record_removals(1);
        self.storage
            .on_delete(&removed.aor, &removed.contact_uri, &removed.alias);
        true
    }

    fn remove_moved_binding(&self, aor: &str, key: &BindingKey, alias: &str) {
        let mut aors = self.aor_index.bucket_for(aor).lock();
        if let Some(aor_entry) = aors.get_mut(aor) {
            if aor_entry.get(key).map(|b| b.alias.as_str()) == Some(alias) {
                aor_entry.remove(key);
            }
            if aor_entry.is_empty() {
                aors.remove(aor);
            }
        }
    }

    /// Removes `alias` from the alias index if `belongs` accepts its entry,
    /// then drops the contact entry pointing at it.
    ///
    /// Must be called with the owning AOR bucket locked (or none at all).
    pub(crate) fn remove_alias_entry_locked(
        &self,
        alias: &str,
        belongs: impl FnOnce(&AliasEntry) -> bool,
    ) -> bool {
        let mut aliases = self.alias_index.bucket_for(alias).lock();
        let Some(entry) = aliases.get(alias) else {
            return false;
        };
        if !belongs(entry) {
            return false;
        }
        let ckey = entry.contact_key();
        aliases.remove(alias);

        let mut contacts = self.contact_index.bucket_for(&ckey).lock();
        if contacts.get(&ckey).map(|a| a.as_str()) == Some(alias) {
            contacts.remove(&ckey);
        }
        true
    }

    pub fn find_alias_entry(&self, alias: &str) -> Option<AliasEntry> {
        self.alias_index.bucket_for(alias).lock().get(alias).cloned()
    }

    /// Finds the alias entry registered for a contact seen from `ip:port`.
    pub fn find_by_contact(&self, contact_uri: &str, ip: &str, port: u16) -> Option<AliasEntry> {
        let ckey = ContactKey::new(contact_uri, ip, port);
        let alias = self
            .contact_index
            .bucket_for(&ckey)
            .lock()
            .get(&ckey)
            .cloned()?;
        // the contact bucket is released here; re-check against the entry
        self.find_alias_entry(&alias)
            .filter(|entry| entry.contact_key() == ckey)
    }

    /// Snapshot alias → contact URI of every binding of `aor`.
    pub fn aor_alias_map(&self, aor: &str) -> BTreeMap<SmolStr, SmolStr> {
        if aor.is_empty() {
            debug!("canonical AOR is empty");
            return BTreeMap::new();
        }
        let aors = self.aor_index.bucket_for(aor).lock();
        aors.get(aor)
            .map(|entry| {
                entry
                    .iter()
                    .map(|(key, binding)| (binding.alias.clone(), key.contact_uri.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every binding of `aor`, sorted by key.
    pub fn aor_bindings(&self, aor: &str) -> Vec<(BindingKey, Binding)> {
        let aors = self.aor_index.bucket_for(aor).lock();
        let mut bindings: Vec<_> = aors
            .get(aor)
            .map(|entry| entry.iter().map(|(k, b)| (k.clone(), b.clone())).collect())
            .unwrap_or_default();
        bindings.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        bindings
    }

    /// Entry counts; buckets are visited one at a time.
    pub fn stats(&self) -> RegCacheStats {
        let (aors, bindings) = self.aor_index.buckets().fold((0, 0), |(aors, bindings), bucket| {
            let guard = bucket.lock();
            (
                aors + guard.len(),
                bindings + guard.values().map(|e| e.len()).sum::<usize>(),
            )
        });
        RegCacheStats {
            aors,
            bindings,
            aliases: self.alias_index.len(),
            contacts: self.contact_index.len(),
        }
    }

    /// Logs the content of all three indices at debug level.
    pub fn dump(&self) {
        debug!("##### REG CACHE DUMP #####");
        self.aor_index.dump("aor");
        debug!("##### ALIAS IDX DUMP #####");
        self.alias_index.dump("alias");
        debug!("##### CONTACT IDX DUMP #####");
        self.contact_index.dump("contact");
        debug!("##### DUMP END #####");
    }
}

fn validate(entry: &AliasEntry) -> Result<()> {
    if entry.aor.is_empty() {
        debug!("canonical AOR is empty");
        return Err(RegCacheError::EmptyAor);
    }
    if entry.alias.is_empty() {
        return Err(RegCacheError::MissingField("alias"));
    }
    if entry.contact_uri.is_empty() {
        return Err(RegCacheError::MissingField("contact_uri"));
    }
    if entry.source_ip.is_empty() {
        return Err(RegCacheError::MissingField("source_ip"));
    }
    Ok(())
}
