//! Job State Store: durable pipeline records with optimistic concurrency.
//!
//! ## Revisions
//!
//! Every persisted record carries a `revision`. `create` stores revision 1;
//! `compare_and_swap(pipeline, expected)` only writes when the stored revision
//! still equals `expected`, stores `expected + 1` and returns it. Losing a race
//! yields [`StoreError::Conflict`]; the caller reloads and re-derives its
//! transition.
//!
//! ## Backends
//!
//! - [`InMemoryJobStore`]: tests and single-process use
//! - [`FileJobStore`]: one JSON file per pipeline, safe across processes
//!   sharing a filesystem
//! - `PostgresJobStore` (feature `postgres`)

pub mod file;
pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use docpipe_core::{DocumentId, IndexName, Pipeline};

pub use file::FileJobStore;
pub use in_memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;

/// Job store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("pipeline not found: {index}/{document_id}")]
    NotFound {
        index: IndexName,
        document_id: DocumentId,
    },

    #[error("pipeline already exists: {index}/{document_id}")]
    AlreadyExists {
        index: IndexName,
        document_id: DocumentId,
    },

    #[error("optimistic concurrency check failed: expected revision {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(index: &IndexName, document_id: &DocumentId) -> Self {
        Self::NotFound {
            index: index.clone(),
            document_id: document_id.clone(),
        }
    }

    pub fn already_exists(index: &IndexName, document_id: &DocumentId) -> Self {
        Self::AlreadyExists {
            index: index.clone(),
            document_id: document_id.clone(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Durable storage of pipeline records keyed by `(index, document_id)`.
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Persist a new pipeline. Fails with `AlreadyExists` if the key is taken.
    ///
    /// Returns the stored revision (always 1).
    async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError>;

    /// Load a pipeline; its `revision` field reflects the stored revision.
    async fn load(&self, index: &IndexName, document_id: &DocumentId)
    -> Result<Pipeline, StoreError>;

    /// Replace the stored record if its revision is still `expected`.
    ///
    /// Returns the new revision.
    async fn compare_and_swap(&self, pipeline: &Pipeline, expected: u64)
    -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> JobStateStore for Arc<S>
where
    S: JobStateStore + ?Sized,
{
    async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError> {
        (**self).create(pipeline).await
    }

    async fn load(
        &self,
        index: &IndexName,
        document_id: &DocumentId,
    ) -> Result<Pipeline, StoreError> {
        (**self).load(index, document_id).await
    }

    async fn compare_and_swap(
        &self,
        pipeline: &Pipeline,
        expected: u64,
    ) -> Result<u64, StoreError> {
        (**self).compare_and_swap(pipeline, expected).await
    }
}
