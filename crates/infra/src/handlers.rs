//! Step Handler Registry.
//!
//! Maps step names to the handlers that run them. Registration happens at
//! startup, before the orchestrator opens its queues; the orchestrator only
//! ever resolves.
//!
//! ## Handler contract
//!
//! A handler receives an owned copy of the pipeline and returns it (with any
//! new artifacts added to `files`) together with an outcome. It never persists
//! anything itself. Deliveries are at-least-once, so a handler may see the same
//! step twice; artifact keys must be deterministic so re-running a step
//! produces the same keys, which the record then ignores.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use docpipe_core::{Pipeline, StepName};

/// How a step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    /// Worth retrying (rate limit, network error, timeout...).
    TransientFailure(String),
    /// Retrying cannot help (unsupported content, invalid input...).
    PermanentFailure(String),
}

/// Handler output: the pipeline as the handler left it plus the outcome.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub pipeline: Pipeline,
    pub outcome: StepOutcome,
}

impl StepResult {
    pub fn success(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            outcome: StepOutcome::Success,
        }
    }

    pub fn transient(pipeline: Pipeline, reason: impl Into<String>) -> Self {
        Self {
            pipeline,
            outcome: StepOutcome::TransientFailure(reason.into()),
        }
    }

    pub fn permanent(pipeline: Pipeline, reason: impl Into<String>) -> Self {
        Self {
            pipeline,
            outcome: StepOutcome::PermanentFailure(reason.into()),
        }
    }

    /// Map an `anyhow` result: errors count as transient failures.
    pub fn from_anyhow(pipeline: Pipeline, result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self::success(pipeline),
            Err(e) => Self::transient(pipeline, format!("{e:#}")),
        }
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step. `cancel` fires when the worker pool is shutting down.
    async fn process(&self, pipeline: Pipeline, cancel: CancellationToken) -> StepResult;
}

#[async_trait]
impl<H> StepHandler for Arc<H>
where
    H: StepHandler + ?Sized,
{
    async fn process(&self, pipeline: Pipeline, cancel: CancellationToken) -> StepResult {
        (**self).process(pipeline, cancel).await
    }
}

/// Adapts an async closure into a [`StepHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(Pipeline, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    async fn process(&self, pipeline: Pipeline, cancel: CancellationToken) -> StepResult {
        (self.f)(pipeline, cancel).await
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no handler registered for step '{0}'")]
    Unregistered(StepName),

    #[error("a handler is already registered for step '{0}'")]
    Duplicate(StepName),
}

/// Step name → handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<StepName, Arc<dyn StepHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("steps", &self.steps())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `step`. Each step takes exactly one handler.
    pub fn register<H>(&mut self, step: StepName, handler: H) -> Result<(), RegistryError>
    where
        H: StepHandler + 'static,
    {
        if self.handlers.contains_key(&step) {
            return Err(RegistryError::Duplicate(step));
        }
        self.handlers.insert(step, Arc::new(handler));
        Ok(())
    }

    /// Register an async closure as the handler for `step`.
    ///
    /// ```ignore
    /// registry.register_fn(StepName::parse("extract")?, |pipeline, _cancel| async move {
    ///     StepResult::success(pipeline)
    /// })?;
    /// ```
    pub fn register_fn<F, Fut>(&mut self, step: StepName, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Pipeline, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        self.register(step, FnHandler { f })
    }

    pub fn resolve(&self, step: &StepName) -> Result<Arc<dyn StepHandler>, RegistryError> {
        self.handlers
            .get(step)
            .cloned()
            .ok_or_else(|| RegistryError::Unregistered(step.clone()))
    }

    pub fn is_registered(&self, step: &StepName) -> bool {
        self.handlers.contains_key(step)
    }

    /// Registered step names, sorted.
    pub fn steps(&self) -> Vec<StepName> {
        let mut steps: Vec<StepName> = self.handlers.keys().cloned().collect();
        steps.sort();
        steps
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
