//! Files attached to a pipeline and the artifacts steps generate for them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::StepName;

/// Kind of output a step produced for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ExtractedText,
    Partition,
    Embedding,
    Other,
}

/// A generated output attached to a file (text section, chunk, vector...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Step that produced the artifact.
    pub source_step: StepName,
    pub mime_type: String,
    pub content: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        kind: ArtifactKind,
        source_step: StepName,
        mime_type: impl Into<String>,
        content: JsonValue,
    ) -> Self {
        Self {
            kind,
            source_step,
            mime_type: mime_type.into(),
            content,
            created_at: Utc::now(),
        }
    }
}

/// Metadata of one file in a pipeline plus its generated artifacts.
///
/// Artifacts are keyed by a handler-chosen name (e.g. `report.pdf.partition.3.txt`).
/// The map is append-only: an artifact key, once written, is never replaced
/// or removed, which is what makes re-running a step harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDetails {
    /// File key, unique within the pipeline.
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    /// Steps that already handled this file.
    #[serde(default)]
    pub processed_by: Vec<StepName>,
}

impl FileDetails {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            artifacts: BTreeMap::new(),
            processed_by: Vec::new(),
        }
    }

    /// Insert an artifact unless one with the same key already exists.
    ///
    /// Returns `true` when the artifact was added.
    pub fn add_artifact(&mut self, key: impl Into<String>, artifact: Artifact) -> bool {
        let key = key.into();
        if self.artifacts.contains_key(&key) {
            return false;
        }
        self.artifacts.insert(key, artifact);
        true
    }

    pub fn artifacts_from(&self, step: &StepName) -> impl Iterator<Item = (&String, &Artifact)> {
        self.artifacts
            .iter()
            .filter(move |(_, a)| &a.source_step == step)
    }

    pub fn already_processed_by(&self, step: &StepName) -> bool {
        self.processed_by.contains(step)
    }

    pub fn mark_processed_by(&mut self, step: &StepName) {
        if !self.already_processed_by(step) {
            self.processed_by.push(step.clone());
        }
    }

    /// Merge another view of the same file, keeping every artifact already present.
    ///
    /// Returns the number of artifacts that were new.
    pub fn merge_artifacts(&mut self, other: &FileDetails) -> usize {
        let mut added = 0;
        for (key, artifact) in &other.artifacts {
            if self.add_artifact(key.clone(), artifact.clone()) {
                added += 1;
            }
        }
        added
    }
}
