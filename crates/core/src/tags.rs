//! Document tags: key → set of values, used for filtering and deletion.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Prefix reserved for tags the system writes itself.
pub const RESERVED_TAG_PREFIX: &str = "__";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagCollection(BTreeMap<String, BTreeSet<String>>);

impl TagCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value under `key`, validating the key.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> DomainResult<()> {
        let key = key.into();
        validate_key(&key)?;
        self.0.entry(key).or_default().insert(value.into());
        Ok(())
    }

    /// Builder-style variant of [`TagCollection::add`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> DomainResult<Self> {
        self.add(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.0.get(key).is_some_and(|values| values.contains(value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    /// Re-check every key; used for collections that arrived through serde.
    pub fn validate(&self) -> DomainResult<()> {
        self.0.keys().try_for_each(|k| validate_key(k))
    }
}

fn validate_key(key: &str) -> DomainResult<()> {
    if key.trim().is_empty() {
        return Err(DomainError::validation("tag key must not be empty"));
    }
    if key.contains(':') {
        return Err(DomainError::validation(format!(
            "tag key '{key}' must not contain ':'"
        )));
    }
    if key.starts_with(RESERVED_TAG_PREFIX) {
        return Err(DomainError::validation(format!(
            "tag key '{key}' uses the reserved prefix '{RESERVED_TAG_PREFIX}'"
        )));
    }
    Ok(())
}
