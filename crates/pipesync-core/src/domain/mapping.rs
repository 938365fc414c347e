//! Versioned remote→local field mapping
//!
//! Which remote fields map to which local fields is an explicit, versioned
//! table loaded at session start, never resolved via runtime reflection.
//! A session pins the mapping version it used so an audit reader can
//! reproduce exactly how payloads were translated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entity::FieldMap;

/// A versioned remote→local field name mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Monotonically increasing mapping version
    version: u32,
    /// remote field name → local field name
    entries: BTreeMap<String, String>,
}

impl FieldMapping {
    /// Creates a mapping with the given version and entries
    pub fn new(version: u32, entries: BTreeMap<String, String>) -> Self {
        Self { version, entries }
    }

    /// The identity mapping: remote field names are used as-is
    pub fn identity(version: u32) -> Self {
        Self {
            version,
            entries: BTreeMap::new(),
        }
    }

    /// Returns the mapping version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Local field name for a remote field
    ///
    /// Unmapped remote fields pass through under their own name, so adding
    /// a remote field never silently drops data.
    pub fn local_name<'a>(&'a self, remote_field: &'a str) -> &'a str {
        self.entries
            .get(remote_field)
            .map(String::as_str)
            .unwrap_or(remote_field)
    }

    /// Remote field name for a local field (reverse lookup)
    ///
    /// Used when pushing local changes back to the remote. Unmapped local
    /// fields pass through under their own name.
    pub fn remote_name<'a>(&'a self, local_field: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|(_, local)| local.as_str() == local_field)
            .map(|(remote, _)| remote.as_str())
            .unwrap_or(local_field)
    }

    /// Translates a remote payload into local field names
    pub fn apply(&self, payload: &FieldMap) -> FieldMap {
        payload
            .iter()
            .map(|(name, value)| (self.local_name(name).to_string(), value.clone()))
            .collect()
    }
}
