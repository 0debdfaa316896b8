//! Backend aliases.
//!
//! An alias is an alternate name for a backend. Aliases come either from a
//! structured mapping or from a delimited string of the form
//! `alias[,alias...]:canonical;...`.

use std::collections::HashMap;

/// Alias → backend name map. Bindings are first-writer-wins.
#[derive(Debug, Default, Clone)]
pub struct AliasMap {
    aliases: HashMap<String, String>,
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `alias` to `backend` unless the alias is already bound.
    ///
    /// Returns `true` if the binding was added.
    pub fn add(&mut self, alias: impl Into<String>, backend: impl Into<String>) -> bool {
        let alias = alias.into();
        if self.aliases.contains_key(&alias) {
            return false;
        }
        self.aliases.insert(alias, backend.into());
        true
    }

    /// Bind every pair, skipping aliases that are already bound.
    pub fn extend<I, A, B>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        for (alias, backend) in pairs {
            self.add(alias, backend);
        }
    }

    pub fn get(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.aliases.contains_key(alias)
    }

    /// Aliases bound to `backend` (case-insensitive on the backend side).
    pub fn aliases_of(&self, backend: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, target)| target.eq_ignore_ascii_case(backend))
            .map(|(alias, _)| alias.clone())
            .collect();
        found.sort();
        found
    }

    pub fn clear(&mut self) {
        self.aliases.clear();
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Parse `alias[,alias...]:canonical;...` into `(alias, canonical)` pairs.
///
/// Segments that do not contain exactly one `:` are skipped, as are empty aliases.
/// Whitespace around names is trimmed.
pub fn parse_alias_spec(spec: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for segment in spec.split(';') {
        let parts: Vec<&str> = segment.split(':').collect();
        let [aliases, backend] = parts.as_slice() else {
            continue;
        };
        let backend = backend.trim();
        for alias in aliases.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            pairs.push((alias.to_string(), backend.to_string()));
        }
    }
    pairs
}
