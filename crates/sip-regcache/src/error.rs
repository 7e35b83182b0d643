// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;

/// Errors reported by registration cache operations.
///
/// Lookup misses are never errors; they are returned as `None` or empty
/// collections. These variants only cover input validation and consistency
/// problems the caller has to decide about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegCacheError {
    /// The AOR could not be canonicalized (malformed URI or unsupported scheme).
    EmptyAor,
    /// A field required to build an index key was empty.
    MissingField(&'static str),
    /// The stored binding uses another alias than the one being written.
    AliasMismatch { stored: SmolStr, requested: SmolStr },
    /// A Contact header value could not be parsed.
    MalformedContact(String),
    /// An `expires` parameter or Expires header was not a valid number.
    MalformedExpires(String),
    /// The local registrar path only accepts a single contact.
    TooManyContacts(usize),
}

impl std::fmt::Display for RegCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyAor => write!(f, "canonical AOR is empty"),
            Self::MissingField(name) => write!(f, "required field '{}' is empty", name),
            Self::AliasMismatch { stored, requested } => write!(
                f,
                "used alias ('{}') is different from stored one ('{}')",
                requested, stored
            ),
            Self::MalformedContact(value) => write!(f, "malformed contact: {}", value),
            Self::MalformedExpires(value) => write!(f, "malformed expires: {}", value),
            Self::TooManyContacts(count) => {
                write!(f, "expected a single contact, got {}", count)
            }
        }
    }
}

impl std::error::Error for RegCacheError {}

pub type Result<T> = std::result::Result<T, RegCacheError>;
