//! The pipeline record: one ingestion job tracked through an ordered step list.
//!
//! All state transitions live here as pure methods on [`Pipeline`]. The
//! orchestrator loads a record, applies one transition and persists the result
//! with a compare-and-swap on `revision`; nothing else mutates a pipeline.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::files::FileDetails;
use crate::id::{DocumentId, IndexName, StepName};
use crate::snapshot::PipelineSnapshot;
use crate::tags::TagCollection;

/// Reason recorded when a dead-lettered message fails its pipeline.
pub const DEAD_LETTERED_REASON: &str = "dead-lettered";

/// Reason recorded when a pipeline is cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

/// Pipeline execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Waiting for the current step to be picked up
    Queued,
    /// A worker is executing the current step
    Running,
    /// Every step succeeded
    Completed,
    /// Terminal failure, see [`FailureKind`]
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }
}

/// Why a pipeline ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler kept reporting transient failures past the retry limit.
    RetriesExhausted,
    /// The handler reported a permanent failure.
    Rejected,
    /// The queue gave up on the message (workers kept crashing or timing out).
    DeadLettered,
    /// Cancelled through the public API.
    Cancelled,
}

/// Outcome of recording a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry budget left; `attempt` is the updated attempt count.
    Retry { attempt: u32 },
    /// Budget exhausted; the pipeline is now `Failed`.
    Exhausted { attempts: u32 },
}

/// A durable ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub index: IndexName,
    pub document_id: DocumentId,
    /// Ordered step list, fixed at creation
    pub steps: Vec<StepName>,
    /// Index into `steps` of the next step to run
    pub cursor: usize,
    pub status: PipelineStatus,
    pub files: BTreeMap<String, FileDetails>,
    pub tags: TagCollection,
    /// Bumped by the store on every persisted mutation
    pub revision: u64,
    /// Transient-failure count per step, reset when the step succeeds
    pub attempts: BTreeMap<StepName, u32>,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// Create a new pipeline.
    ///
    /// Step names must be unique, file keys must be unique and tags must not use
    /// reserved keys. An empty step list yields a pipeline that is already
    /// `Completed`.
    pub fn new(
        index: IndexName,
        document_id: DocumentId,
        steps: Vec<StepName>,
        files: Vec<FileDetails>,
        tags: TagCollection,
    ) -> DomainResult<Self> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step) {
                return Err(DomainError::validation(format!(
                    "step '{step}' appears more than once"
                )));
            }
        }

        let mut file_map = BTreeMap::new();
        for file in files {
            if file.id.trim().is_empty() {
                return Err(DomainError::validation("file key must not be empty"));
            }
            if file_map.contains_key(&file.id) {
                return Err(DomainError::validation(format!(
                    "file '{}' appears more than once",
                    file.id
                )));
            }
            file_map.insert(file.id.clone(), file);
        }

        tags.validate()?;

        let now = Utc::now();
        let status = if steps.is_empty() {
            PipelineStatus::Completed
        } else {
            PipelineStatus::Queued
        };

        Ok(Self {
            index,
            document_id,
            steps,
            cursor: 0,
            status,
            files: file_map,
            tags,
            revision: 0,
            attempts: BTreeMap::new(),
            last_error: None,
            failure: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// The step eligible for dispatch, if the pipeline is still active.
    pub fn current_step(&self) -> Option<&StepName> {
        if self.is_terminal() {
            return None;
        }
        self.steps.get(self.cursor)
    }

    /// The step that ran right before the current one.
    pub fn previous_step(&self) -> Option<&StepName> {
        self.cursor.checked_sub(1).and_then(|i| self.steps.get(i))
    }

    pub fn completed_steps(&self) -> &[StepName] {
        &self.steps[..self.cursor.min(self.steps.len())]
    }

    pub fn remaining_steps(&self) -> &[StepName] {
        &self.steps[self.cursor.min(self.steps.len())..]
    }

    pub fn attempts_for(&self, step: &StepName) -> u32 {
        self.attempts.get(step).copied().unwrap_or(0)
    }

    /// Mark the current step as picked up by a worker.
    pub fn mark_running(&mut self) -> DomainResult<()> {
        match self.status {
            PipelineStatus::Queued => {
                self.status = PipelineStatus::Running;
                self.touch();
                Ok(())
            }
            PipelineStatus::Running => Ok(()),
            status => Err(DomainError::invalid_transition(format!(
                "cannot start a step of a {status:?} pipeline"
            ))),
        }
    }

    /// Apply a successful step: merge the handler's files, advance the cursor.
    ///
    /// Artifacts already stored are never replaced; files the handler added are
    /// inserted. Returns the number of newly stored artifacts.
    pub fn complete_step(
        &mut self,
        step: &StepName,
        produced: &BTreeMap<String, FileDetails>,
    ) -> DomainResult<usize> {
        self.ensure_current(step)?;

        let mut added = 0;
        for (key, incoming) in produced {
            match self.files.get_mut(key) {
                Some(stored) => added += stored.merge_artifacts(incoming),
                None => {
                    added += incoming.artifacts.len();
                    self.files.insert(key.clone(), incoming.clone());
                }
            }
        }
        for file in self.files.values_mut() {
            file.mark_processed_by(step);
        }

        self.attempts.insert(step.clone(), 0);
        self.last_error = None;
        self.cursor += 1;
        self.status = if self.cursor == self.steps.len() {
            PipelineStatus::Completed
        } else {
            PipelineStatus::Queued
        };
        self.touch();
        Ok(added)
    }

    /// Count a transient failure against `step`.
    ///
    /// The pipeline stays retryable while the attempt count is at most
    /// `limit`; one more failure makes it `Failed`.
    pub fn record_transient_failure(
        &mut self,
        step: &StepName,
        reason: impl Into<String>,
        limit: u32,
    ) -> DomainResult<RetryDecision> {
        self.ensure_current(step)?;

        let attempt = self.attempts_for(step) + 1;
        self.attempts.insert(step.clone(), attempt);
        self.last_error = Some(reason.into());
        self.touch();

        if attempt <= limit {
            self.status = PipelineStatus::Queued;
            Ok(RetryDecision::Retry { attempt })
        } else {
            self.fail(FailureKind::RetriesExhausted);
            Ok(RetryDecision::Exhausted { attempts: attempt })
        }
    }

    /// Fail the pipeline because the handler rejected the input.
    pub fn reject(&mut self, step: &StepName, reason: impl Into<String>) -> DomainResult<()> {
        self.ensure_current(step)?;
        self.last_error = Some(reason.into());
        self.fail(FailureKind::Rejected);
        Ok(())
    }

    /// Fail the pipeline because the queue dead-lettered the step's message.
    pub fn mark_dead_lettered(&mut self, step: &StepName) -> DomainResult<()> {
        self.ensure_current(step)?;
        self.last_error = Some(DEAD_LETTERED_REASON.to_string());
        self.fail(FailureKind::DeadLettered);
        Ok(())
    }

    /// Cancel an active pipeline.
    pub fn cancel(&mut self) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "cannot cancel a {:?} pipeline",
                self.status
            )));
        }
        self.last_error = Some(CANCELLED_REASON.to_string());
        self.fail(FailureKind::Cancelled);
        Ok(())
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot::from(self)
    }

    fn ensure_current(&self, step: &StepName) -> DomainResult<()> {
        match self.current_step() {
            Some(current) if current == step => Ok(()),
            Some(current) => Err(DomainError::invalid_transition(format!(
                "step '{step}' is not current (current is '{current}')"
            ))),
            None => Err(DomainError::invalid_transition(format!(
                "pipeline is {:?}; step '{step}' cannot change it",
                self.status
            ))),
        }
    }

    fn fail(&mut self, kind: FailureKind) {
        self.status = PipelineStatus::Failed;
        self.failure = Some(kind);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
