//! Pipeline Orchestrator: creates jobs and drives them through their steps.
//!
//! ## Dispatch
//!
//! For every delivery the orchestrator:
//!
//! 1. loads the pipeline; unknown or terminal pipelines are acknowledged and dropped
//! 2. checks the message names the current step; a message for an earlier
//!    step re-dispatches the current step (deduplicated) and is dropped
//! 3. marks the pipeline `Running` (compare-and-swap)
//! 4. invokes the handler once, under the handler timeout
//! 5. applies the outcome and persists it with compare-and-swap; on a revision
//!    conflict it reloads and re-derives the transition without invoking the
//!    handler again
//! 6. only then enqueues the next step, acknowledges, or requeues with backoff
//!
//! A crash anywhere in this sequence leaves the message to lease expiry. The
//! redelivery either repeats the step (handlers are idempotent) or, if the
//! success was already persisted, takes the stale path in step 2, which
//! re-enqueues the step that may have been lost.

pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use docpipe_core::{
    DocumentId, DomainError, FileDetails, IndexName, Pipeline, PipelineSnapshot,
    PipelineStatus, RetryDecision, StepName, TagCollection,
};

use crate::config::PipelineSettings;
use crate::handlers::{HandlerRegistry, RegistryError, StepOutcome};
use crate::queue::{
    DeadLetterEntry, Delivery, EnqueueOutcome, MessageQueue, QueueBackend, QueueError,
    QueueMessage, Receipt,
};
use crate::store::{JobStateStore, StoreError};

pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no queue is open for step '{0}'")]
    UnknownStep(StepName),

    #[error("gave up on {index}/{document_id} after {attempts} revision conflicts")]
    ConflictRetriesExhausted {
        index: IndexName,
        document_id: DocumentId,
        attempts: u32,
    },
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Step succeeded; the next step was enqueued.
    Advanced,
    /// Last step succeeded; the pipeline is complete.
    Completed,
    /// Transient failure; the message was requeued with backoff.
    Retrying,
    /// The pipeline failed (retries exhausted, rejected, or dead-lettered).
    Failed,
    /// The message no longer matched the pipeline and was dropped.
    Stale,
    /// Shutdown interrupted a failing handler; the lease was released without
    /// counting an attempt.
    Released,
}

/// Request to create an ingestion job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub index: IndexName,
    /// Generated when `None`.
    pub document_id: Option<DocumentId>,
    pub steps: Vec<StepName>,
    pub files: Vec<FileDetails>,
    pub tags: TagCollection,
}

impl NewJob {
    pub fn new(index: IndexName, steps: Vec<StepName>) -> Self {
        Self {
            index,
            document_id: None,
            steps,
            files: Vec::new(),
            tags: TagCollection::new(),
        }
    }

    pub fn with_document_id(mut self, document_id: DocumentId) -> Self {
        self.document_id = Some(document_id);
        self
    }

    pub fn with_file(mut self, file: FileDetails) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_tags(mut self, tags: TagCollection) -> Self {
        self.tags = tags;
        self
    }
}

/// Where the message stands relative to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Guard {
    /// The message is for the current step.
    Current,
    /// The message is for a step the pipeline already passed; `current`
    /// should be (re-)dispatched in case its message was lost.
    Behind { current: StepName },
    /// Terminal pipeline, or a step the pipeline never reaches.
    Drop,
}

fn classify(pipeline: &Pipeline, step: &StepName) -> Guard {
    let Some(current) = pipeline.current_step() else {
        return Guard::Drop;
    };
    if current == step {
        return Guard::Current;
    }
    if pipeline.completed_steps().contains(step) {
        return Guard::Behind {
            current: current.clone(),
        };
    }
    Guard::Drop
}

/// Result of applying a handler outcome to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Applied {
    Advanced { next: StepName },
    Completed,
    Retry { attempt: u32, delay: Duration },
    Failed,
}

pub struct Orchestrator {
    settings: PipelineSettings,
    store: Arc<dyn JobStateStore>,
    registry: HandlerRegistry,
    queues: HashMap<StepName, Arc<dyn MessageQueue>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("steps", &self.registry.steps())
            .finish()
    }
}

impl Orchestrator {
    /// Open one queue per registered step.
    pub async fn new(
        settings: PipelineSettings,
        store: Arc<dyn JobStateStore>,
        queues: &dyn QueueBackend,
        registry: HandlerRegistry,
    ) -> Result<Self, OrchestratorError> {
        let mut opened = HashMap::new();
        for step in registry.steps() {
            let queue = queues.open(&step).await?;
            opened.insert(step, queue);
        }
        info!(steps = ?registry.steps(), "orchestrator ready");
        Ok(Self {
            settings,
            store,
            registry,
            queues: opened,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Steps that have a handler and a queue.
    pub fn steps(&self) -> Vec<StepName> {
        self.registry.steps()
    }

    pub fn queue(&self, step: &StepName) -> Result<&Arc<dyn MessageQueue>, OrchestratorError> {
        self.queues
            .get(step)
            .ok_or_else(|| OrchestratorError::UnknownStep(step.clone()))
    }

    /// Persist a new pipeline and dispatch its first step.
    ///
    /// Every step must have a registered handler.
    #[instrument(skip_all, fields(index = %job.index), err)]
    pub async fn create_job(&self, job: NewJob) -> Result<DocumentId, OrchestratorError> {
        for step in &job.steps {
            self.registry.resolve(step)?;
        }

        let document_id = job.document_id.unwrap_or_else(DocumentId::generate);
        let pipeline = Pipeline::new(job.index, document_id.clone(), job.steps, job.files, job.tags)?;
        self.store.create(&pipeline).await?;

        match pipeline.current_step() {
            Some(step) => {
                self.dispatch(&pipeline, step).await?;
                info!(document_id = %document_id, steps = pipeline.steps.len(), "pipeline created");
            }
            None => info!(document_id = %document_id, "pipeline created without steps; already complete"),
        }
        Ok(document_id)
    }

    pub async fn status(
        &self,
        index: &IndexName,
        document_id: &DocumentId,
    ) -> Result<PipelineSnapshot, OrchestratorError> {
        Ok(self.store.load(index, document_id).await?.snapshot())
    }

    /// Mark an active pipeline as `Failed`. Its in-flight messages drain: they
    /// are dropped the next time a worker sees them.
    #[instrument(skip_all, fields(index = %index, document_id = %document_id), err)]
    pub async fn cancel(
        &self,
        index: &IndexName,
        document_id: &DocumentId,
    ) -> Result<PipelineSnapshot, OrchestratorError> {
        let mut conflicts = 0;
        loop {
            let current = self.store.load(index, document_id).await?;
            let mut next = current.clone();
            next.cancel()?;
            match self.store.compare_and_swap(&next, current.revision).await {
                Ok(revision) => {
                    next.revision = revision;
                    info!("pipeline cancelled");
                    return Ok(next.snapshot());
                }
                Err(e) if e.is_conflict() => self.note_conflict(&current, &mut conflicts)?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Re-dispatch the current step of an active pipeline.
    ///
    /// Recovers pipelines whose message was lost (e.g. a crash right after
    /// `create_job` persisted the record). Harmless otherwise: a still-pending
    /// message makes this a no-op.
    #[instrument(skip_all, fields(index = %index, document_id = %document_id), err)]
    pub async fn resume(
        &self,
        index: &IndexName,
        document_id: &DocumentId,
    ) -> Result<EnqueueOutcome, OrchestratorError> {
        let pipeline = self.store.load(index, document_id).await?;
        let step = pipeline.current_step().ok_or_else(|| {
            DomainError::invalid_transition(format!(
                "cannot resume a {:?} pipeline",
                pipeline.status
            ))
        })?;
        self.dispatch(&pipeline, step).await
    }

    /// Dead-lettered messages of one step queue, newest first.
    pub async fn dead_letters(
        &self,
        step: &StepName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, OrchestratorError> {
        Ok(self.queue(step)?.dead_letters(limit).await?)
    }

    /// Fail the pipelines behind dead letters that were never recorded.
    ///
    /// The queue drops a message before the orchestrator records the failure,
    /// so a crash or shutdown in between leaves an active pipeline with no
    /// message. Re-applying the newest `limit` dead letters of `step` settles
    /// those; entries already recorded are no-ops. Returns the number of
    /// pipelines failed.
    #[instrument(skip_all, fields(step = %step), err)]
    pub async fn recover_dead_letters(
        &self,
        step: &StepName,
        limit: usize,
    ) -> Result<usize, OrchestratorError> {
        let mut failed = 0;
        for entry in self.queue(step)?.dead_letters(limit).await? {
            if self
                .handle_dead_letter(&entry.message, entry.delivery_count)
                .await?
                == Disposition::Failed
            {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(failed, "recovered unrecorded dead letters");
        }
        Ok(failed)
    }

    /// Handle one delivery taken from the queue of `step`.
    ///
    /// Errors mean the outcome could not be made durable; the message is then
    /// left to lease expiry and will be redelivered.
    #[instrument(
        skip_all,
        fields(
            index = %delivery.message.index,
            document_id = %delivery.message.document_id,
            step = %step,
            delivery_count = delivery.delivery_count
        ),
        err
    )]
    pub async fn process_delivery(
        &self,
        step: &StepName,
        delivery: Delivery,
        shutdown: &CancellationToken,
    ) -> Result<Disposition, OrchestratorError> {
        let queue = self.queue(step)?.clone();
        let message = &delivery.message;

        if &message.step != step {
            warn!(message_step = %message.step, "message arrived on the wrong queue; dropping");
            self.ack(queue.as_ref(), &delivery.receipt).await?;
            return Ok(Disposition::Stale);
        }

        let loaded = match self.store.load(&message.index, &message.document_id).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                warn!("pipeline not found; dropping message");
                self.ack(queue.as_ref(), &delivery.receipt).await?;
                return Ok(Disposition::Stale);
            }
            Err(e) => return Err(e.into()),
        };

        let mut conflicts = 0;
        let Some(running) = self
            .claim(loaded, queue.as_ref(), &delivery, &mut conflicts)
            .await?
        else {
            return Ok(Disposition::Stale);
        };

        let (produced, outcome) = self.invoke(step, &running, shutdown).await?;

        if shutdown.is_cancelled() && outcome != StepOutcome::Success {
            info!("shutdown interrupted the step; releasing the message");
            self.release(queue.as_ref(), &delivery.receipt).await?;
            return Ok(Disposition::Released);
        }

        let limit = self.settings.retry.limit_for(step);
        let mut current = running;
        let (persisted, applied) = loop {
            let mut next = current.clone();
            let applied = self.apply(&mut next, step, &produced, &outcome, limit)?;
            match self.store.compare_and_swap(&next, current.revision).await {
                Ok(revision) => {
                    next.revision = revision;
                    break (next, applied);
                }
                Err(e) if e.is_conflict() => {
                    self.note_conflict(&current, &mut conflicts)?;
                    current = self.store.load(&message.index, &message.document_id).await?;
                    if classify(&current, step) != Guard::Current {
                        return self.settle_stale(&current, step, queue.as_ref(), &delivery).await;
                    }
                    debug!("revision conflict; re-applying outcome to the reloaded pipeline");
                }
                Err(e) => return Err(e.into()),
            }
        };

        match applied {
            Applied::Advanced { next } => {
                self.dispatch(&persisted, &next).await?;
                self.ack(queue.as_ref(), &delivery.receipt).await?;
                info!(next_step = %next, cursor = persisted.cursor, "step completed");
                Ok(Disposition::Advanced)
            }
            Applied::Completed => {
                self.ack(queue.as_ref(), &delivery.receipt).await?;
                info!("pipeline completed");
                Ok(Disposition::Completed)
            }
            Applied::Retry { attempt, delay } => {
                warn!(
                    attempt,
                    limit,
                    delay_ms = delay.as_millis() as u64,
                    error = persisted.last_error.as_deref().unwrap_or_default(),
                    "transient step failure; retrying"
                );
                self.release_after(queue.as_ref(), &delivery.receipt, delay)
                    .await?;
                Ok(Disposition::Retrying)
            }
            Applied::Failed => {
                self.ack(queue.as_ref(), &delivery.receipt).await?;
                error!(
                    failure = ?persisted.failure,
                    error = persisted.last_error.as_deref().unwrap_or_default(),
                    attempts = persisted.attempts_for(step),
                    "pipeline failed"
                );
                Ok(Disposition::Failed)
            }
        }
    }

    /// Fail the pipeline a dead-lettered message belonged to.
    #[instrument(
        skip_all,
        fields(
            index = %message.index,
            document_id = %message.document_id,
            step = %message.step,
            delivery_count = delivery_count
        ),
        err
    )]
    pub async fn handle_dead_letter(
        &self,
        message: &QueueMessage,
        delivery_count: u32,
    ) -> Result<Disposition, OrchestratorError> {
        let mut conflicts = 0;
        loop {
            let current = match self.store.load(&message.index, &message.document_id).await {
                Ok(p) => p,
                Err(e) if e.is_not_found() => return Ok(Disposition::Stale),
                Err(e) => return Err(e.into()),
            };

            match classify(&current, &message.step) {
                Guard::Current => {}
                Guard::Behind { current: step } => {
                    self.dispatch(&current, &step).await?;
                    return Ok(Disposition::Stale);
                }
                Guard::Drop => return Ok(Disposition::Stale),
            }

            let mut next = current.clone();
            next.mark_dead_lettered(&message.step)?;
            match self.store.compare_and_swap(&next, current.revision).await {
                Ok(_) => {
                    error!(delivery_count, "message dead-lettered; pipeline failed");
                    return Ok(Disposition::Failed);
                }
                Err(e) if e.is_conflict() => self.note_conflict(&current, &mut conflicts)?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Make sure `pipeline` is `Running` at the message's step.
    ///
    /// Returns `None` when the message turned out to be stale (already settled).
    async fn claim(
        &self,
        mut pipeline: Pipeline,
        queue: &dyn MessageQueue,
        delivery: &Delivery,
        conflicts: &mut u32,
    ) -> Result<Option<Pipeline>, OrchestratorError> {
        let step = &delivery.message.step;
        loop {
            if classify(&pipeline, step) != Guard::Current {
                self.settle_stale(&pipeline, step, queue, delivery).await?;
                return Ok(None);
            }
            if pipeline.status == PipelineStatus::Running {
                // Redelivery after a lost lease, or a duplicate running concurrently.
                debug!("pipeline already running this step");
                return Ok(Some(pipeline));
            }

            let mut running = pipeline.clone();
            running.mark_running()?;
            match self.store.compare_and_swap(&running, pipeline.revision).await {
                Ok(revision) => {
                    running.revision = revision;
                    return Ok(Some(running));
                }
                Err(e) if e.is_conflict() => {
                    self.note_conflict(&pipeline, conflicts)?;
                    pipeline = self.store.load(&pipeline.index, &pipeline.document_id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run the handler once. Timeouts and panics become transient failures.
    async fn invoke(
        &self,
        step: &StepName,
        pipeline: &Pipeline,
        shutdown: &CancellationToken,
    ) -> Result<(Pipeline, StepOutcome), OrchestratorError> {
        let handler = self.registry.resolve(step)?;
        let cancel = shutdown.child_token();
        let timeout = self.settings.handler_timeout;

        let task = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handler.process(pipeline, cancel).await })
        };
        let abort = task.abort_handle();

        let result = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => (result.pipeline, result.outcome),
            Ok(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    "handler panicked".to_string()
                } else {
                    format!("handler task failed: {join_error}")
                };
                (pipeline.clone(), StepOutcome::TransientFailure(reason))
            }
            Err(_) => {
                cancel.cancel();
                abort.abort();
                (
                    pipeline.clone(),
                    StepOutcome::TransientFailure(format!(
                        "handler timed out after {}ms",
                        timeout.as_millis()
                    )),
                )
            }
        };
        Ok(result)
    }

    /// Apply a handler outcome to `next` (a copy of the stored record).
    fn apply(
        &self,
        next: &mut Pipeline,
        step: &StepName,
        produced: &Pipeline,
        outcome: &StepOutcome,
        limit: u32,
    ) -> Result<Applied, OrchestratorError> {
        let applied = match outcome {
            StepOutcome::Success => {
                let added = next.complete_step(step, &produced.files)?;
                debug!(artifacts_added = added, "merged step artifacts");
                match next.current_step() {
                    Some(following) => Applied::Advanced {
                        next: following.clone(),
                    },
                    None => Applied::Completed,
                }
            }
            StepOutcome::TransientFailure(reason) => {
                match next.record_transient_failure(step, reason.clone(), limit)? {
                    RetryDecision::Retry { attempt } => Applied::Retry {
                        attempt,
                        delay: self.settings.retry.delay_for_attempt(attempt),
                    },
                    RetryDecision::Exhausted { .. } => Applied::Failed,
                }
            }
            StepOutcome::PermanentFailure(reason) => {
                next.reject(step, reason.clone())?;
                Applied::Failed
            }
        };
        Ok(applied)
    }

    async fn dispatch(
        &self,
        pipeline: &Pipeline,
        step: &StepName,
    ) -> Result<EnqueueOutcome, OrchestratorError> {
        let message = QueueMessage::new(
            pipeline.index.clone(),
            pipeline.document_id.clone(),
            step.clone(),
        );
        let outcome = self.queue(step)?.enqueue(message, Duration::ZERO).await?;
        debug!(step = %step, ?outcome, "dispatched step");
        Ok(outcome)
    }

    /// Drop a message that no longer matches its pipeline.
    async fn settle_stale(
        &self,
        pipeline: &Pipeline,
        step: &StepName,
        queue: &dyn MessageQueue,
        delivery: &Delivery,
    ) -> Result<Disposition, OrchestratorError> {
        if let Guard::Behind { current } = classify(pipeline, step) {
            self.dispatch(pipeline, &current).await?;
        }
        debug!(status = ?pipeline.status, cursor = pipeline.cursor, "stale message dropped");
        self.ack(queue, &delivery.receipt).await?;
        Ok(Disposition::Stale)
    }

    fn note_conflict(&self, pipeline: &Pipeline, conflicts: &mut u32) -> Result<(), OrchestratorError> {
        *conflicts += 1;
        if *conflicts > self.settings.max_conflict_retries {
            return Err(OrchestratorError::ConflictRetriesExhausted {
                index: pipeline.index.clone(),
                document_id: pipeline.document_id.clone(),
                attempts: *conflicts,
            });
        }
        Ok(())
    }

    /// Acknowledge, tolerating a lease that expired meanwhile: the redelivery
    /// will find the pipeline moved on and drop itself.
    async fn ack(&self, queue: &dyn MessageQueue, receipt: &Receipt) -> Result<(), OrchestratorError> {
        match queue.acknowledge(receipt).await {
            Ok(()) => Ok(()),
            Err(QueueError::ReceiptNotFound(id)) => {
                warn!(message_id = %id, "lease expired before acknowledgement");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, queue: &dyn MessageQueue, receipt: &Receipt) -> Result<(), OrchestratorError> {
        self.release_after(queue, receipt, Duration::ZERO).await
    }

    async fn release_after(
        &self,
        queue: &dyn MessageQueue,
        receipt: &Receipt,
        delay: Duration,
    ) -> Result<(), OrchestratorError> {
        match queue.requeue(receipt, delay).await {
            Ok(()) => Ok(()),
            Err(QueueError::ReceiptNotFound(id)) => {
                warn!(message_id = %id, "lease expired before release; message is already visible");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
