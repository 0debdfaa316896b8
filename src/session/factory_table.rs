//! Case-insensitive backend name → factory table.
//!
//! Backend names usually come from configuration, so every operation canonicalizes
//! the key to uppercase before touching the map.

use super::FactoryRef;
use crate::error::{SessionError, SessionResult};
use std::collections::HashMap;

/// Canonical (uppercase) form of a backend name.
pub fn canonical_name(name: &str) -> String {
    name.to_uppercase()
}

#[derive(Default, Clone)]
pub struct FactoryTable {
    factories: HashMap<String, FactoryRef>,
}

impl FactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a factory. Fails with `DuplicateKey` if the name is already taken.
    pub fn add(&mut self, name: &str, factory: FactoryRef) -> SessionResult<()> {
        let key = canonical_name(name);
        if self.factories.contains_key(&key) {
            return Err(SessionError::duplicate_key(key));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<FactoryRef> {
        self.factories.remove(&canonical_name(name))
    }

    /// Look up a factory. Fails with `NotFound` if the name is unknown.
    pub fn get(&self, name: &str) -> SessionResult<FactoryRef> {
        self.try_get(name)
            .ok_or_else(|| SessionError::not_found(canonical_name(name)))
    }

    pub fn try_get(&self, name: &str) -> Option<FactoryRef> {
        self.factories.get(&canonical_name(name)).cloned()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.factories.contains_key(&canonical_name(name))
    }

    /// Canonical names of all registered backends.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &FactoryRef> {
        self.factories.values()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for FactoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryTable")
            .field("backends", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
