//! `docpipe-core`: the pipeline record and its state transitions.
//!
//! This crate is **pure domain**: identifiers, the job record, files and
//! artifacts, tags, and the status view. Storage, queues and workers live in
//! `docpipe-infra`.

pub mod error;
pub mod files;
pub mod id;
pub mod pipeline;
pub mod snapshot;
pub mod tags;

pub use error::{DomainError, DomainResult};
pub use files::{Artifact, ArtifactKind, FileDetails};
pub use id::{DocumentId, IndexName, StepName};
pub use pipeline::{FailureKind, Pipeline, PipelineStatus, RetryDecision};
pub use snapshot::PipelineSnapshot;
pub use tags::TagCollection;
