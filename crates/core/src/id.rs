//! Strongly-typed identifiers used across the pipeline.
//!
//! All identifiers are plain strings on the wire, but each one restricts the
//! characters it accepts so it can be embedded safely in file paths, queue
//! names and message ids.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

const MAX_ID_LEN: usize = 256;

/// Logical namespace a pipeline writes into (a.k.a. the memory index).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndexName(String);

/// Identifier of an ingested document; unique within an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

/// Name of a pipeline step (e.g. `extract`, `partition`, `gen_embeddings`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StepName(String);

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn is_step_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-')
}

fn validate(name: &'static str, value: &str, allowed: fn(char) -> bool) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::invalid_id(format!("{name}: must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(DomainError::invalid_id(format!(
            "{name}: longer than {MAX_ID_LEN} characters"
        )));
    }
    if let Some(bad) = value.chars().find(|c| !allowed(*c)) {
        return Err(DomainError::invalid_id(format!(
            "{name}: '{value}' contains invalid character '{bad}'"
        )));
    }
    // Leading dots would turn into hidden / relative path segments.
    if value.starts_with('.') {
        return Err(DomainError::invalid_id(format!("{name}: must not start with '.'")));
    }
    Ok(())
}

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal, $allowed:expr) => {
        impl $t {
            /// Parse and validate an identifier.
            pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                validate($name, &value, $allowed)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_string_newtype!(IndexName, "IndexName", is_id_char);
impl_string_newtype!(DocumentId, "DocumentId", is_id_char);
impl_string_newtype!(StepName, "StepName", is_step_char);

impl IndexName {
    pub const DEFAULT: &'static str = "default";

    /// The index used when the caller does not name one.
    pub fn default_index() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    /// Normalize optional user input: blank means the default index.
    pub fn or_default(value: Option<&str>) -> Result<Self, DomainError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::default_index()),
            Some(v) => Self::parse(v),
        }
    }
}

impl Default for IndexName {
    fn default() -> Self {
        Self::default_index()
    }
}

impl DocumentId {
    /// Generate a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing ids explicitly in tests for
    /// determinism.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}
