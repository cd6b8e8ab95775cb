//! Read-only status view of a pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DocumentId, IndexName, StepName};
use crate::pipeline::{FailureKind, Pipeline, PipelineStatus};
use crate::tags::TagCollection;

/// What a client sees when asking for the status of an ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub index: IndexName,
    pub document_id: DocumentId,
    pub status: PipelineStatus,
    pub completed: bool,
    /// True when the job was created without any files.
    pub empty: bool,
    pub failed: bool,
    pub steps: Vec<StepName>,
    pub completed_steps: Vec<StepName>,
    pub remaining_steps: Vec<StepName>,
    pub attempts: BTreeMap<StepName, u32>,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    pub tags: TagCollection,
    pub revision: u64,
    pub creation: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl From<&Pipeline> for PipelineSnapshot {
    fn from(p: &Pipeline) -> Self {
        Self {
            index: p.index.clone(),
            document_id: p.document_id.clone(),
            status: p.status,
            completed: p.status == PipelineStatus::Completed,
            empty: p.files.is_empty(),
            failed: p.status == PipelineStatus::Failed,
            steps: p.steps.clone(),
            completed_steps: p.completed_steps().to_vec(),
            remaining_steps: p.remaining_steps().to_vec(),
            attempts: p.attempts.clone(),
            last_error: p.last_error.clone(),
            failure: p.failure,
            tags: p.tags.clone(),
            revision: p.revision,
            creation: p.created_at,
            last_update: p.updated_at,
        }
    }
}
