//! File-backed job store.
//!
//! Layout: `<root>/<index>/<document_id>/pipeline.json`. Writes go to a temp
//! file that is renamed over the record, so readers never observe a partial
//! write. Create and compare-and-swap hold an exclusive advisory lock on
//! `pipeline.lock` for the read-check-write sequence. The operating system
//! drops the lock when its holder exits, so a crashed process never leaves a
//! pipeline locked and the lock file itself is never removed.

use std::fs::{File, TryLockError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tracing::instrument;
use uuid::Uuid;

use docpipe_core::{DocumentId, IndexName, Pipeline};

use super::{JobStateStore, StoreError};

const RECORD_FILE: &str = "pipeline.json";
const LOCK_FILE: &str = "pipeline.lock";
const LOCK_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct FileJobStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, index: &IndexName, document_id: &DocumentId) -> PathBuf {
        self.root.join(index.as_str()).join(document_id.as_str())
    }

    async fn read_record(path: &Path) -> Result<Option<Pipeline>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", path, e)),
        }
    }

    async fn write_record(dir: &Path, pipeline: &Pipeline) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(pipeline)?;
        let tmp = dir.join(format!("{RECORD_FILE}.{}.tmp", Uuid::now_v7()));
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        let target = dir.join(RECORD_FILE);
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error("rename", &target, e));
        }
        Ok(())
    }

    async fn lock(&self, dir: &Path) -> Result<LockGuard, StoreError> {
        let path = dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| io_error("open lock", &path, e))?
            .into_std()
            .await;

        let started = tokio::time::Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(TryLockError::WouldBlock) => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(StoreError::Storage(format!(
                            "timed out waiting for lock {}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(TryLockError::Error(e)) => return Err(io_error("lock", &path, e)),
            }
        }
    }
}

/// Holds the advisory lock; released when dropped, including on error paths.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Storage(format!("{op} {}: {e}", path.display()))
}

#[async_trait]
impl JobStateStore for FileJobStore {
    #[instrument(skip(self, pipeline), fields(index = %pipeline.index, document_id = %pipeline.document_id), err)]
    async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError> {
        let dir = self.dir(&pipeline.index, &pipeline.document_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create dir", &dir, e))?;

        let _guard = self.lock(&dir).await?;
        if Self::read_record(&dir.join(RECORD_FILE)).await?.is_some() {
            return Err(StoreError::already_exists(
                &pipeline.index,
                &pipeline.document_id,
            ));
        }

        let mut stored = pipeline.clone();
        stored.revision = 1;
        Self::write_record(&dir, &stored).await?;
        Ok(1)
    }

    async fn load(
        &self,
        index: &IndexName,
        document_id: &DocumentId,
    ) -> Result<Pipeline, StoreError> {
        let path = self.dir(index, document_id).join(RECORD_FILE);
        Self::read_record(&path)
            .await?
            .ok_or_else(|| StoreError::not_found(index, document_id))
    }

    #[instrument(skip(self, pipeline), fields(index = %pipeline.index, document_id = %pipeline.document_id), err(level = "debug"))]
    async fn compare_and_swap(
        &self,
        pipeline: &Pipeline,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let dir = self.dir(&pipeline.index, &pipeline.document_id);
        if fs::metadata(&dir).await.is_err() {
            return Err(StoreError::not_found(
                &pipeline.index,
                &pipeline.document_id,
            ));
        }

        let _guard = self.lock(&dir).await?;
        let current = Self::read_record(&dir.join(RECORD_FILE))
            .await?
            .ok_or_else(|| StoreError::not_found(&pipeline.index, &pipeline.document_id))?;

        if current.revision != expected {
            return Err(StoreError::Conflict {
                expected,
                actual: current.revision,
            });
        }

        let mut next = pipeline.clone();
        next.revision = expected + 1;
        Self::write_record(&dir, &next).await?;
        Ok(next.revision)
    }
}
