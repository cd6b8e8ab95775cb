//! Infrastructure layer: job state stores, step queues, the orchestrator and
//! the workers that drive pipelines.

pub mod config;
pub mod handlers;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{BackendConfig, Backends, ConfigError, PipelineSettings, QueueConfig, StoreConfig};
pub use handlers::{HandlerRegistry, RegistryError, StepHandler, StepOutcome, StepResult};
pub use orchestrator::{Disposition, NewJob, Orchestrator, OrchestratorError, RetryPolicy};
pub use queue::{MessageQueue, QueueBackend, QueueError, QueueMessage, QueueOptions};
pub use store::{JobStateStore, StoreError};
pub use workers::{WorkerPool, WorkerPoolHandle, WorkerStatsSnapshot};
