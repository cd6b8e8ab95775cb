//! File-backed queue: one JSON document per pending message.
//!
//! Layout under `<root>/<queue name>/`:
//!
//! - `<message id>.json`: the message plus its delivery count, visibility time
//!   and current lease token
//! - `dead/<millis>-<message id>.json`: dead-letter entries
//!
//! Every dequeue re-scans the directory, so expired leases need no sweeper.
//! Updates are written to a temp file and renamed into place. Mutations are
//! serialized with a process-local mutex: several workers in one process may
//! share a queue directory, several processes may not.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use docpipe_core::StepName;

use super::{
    DeadLetterEntry, Delivery, EnqueueOutcome, MessageQueue, QueueBackend, QueueError,
    QueueMessage, QueueOptions, Receipt,
};

const DEAD_DIR: &str = "dead";
const MAX_SCAN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    message: QueueMessage,
    delivery_count: u32,
    visible_after: DateTime<Utc>,
    lease: Option<Uuid>,
}

#[derive(Debug)]
pub struct FileQueue {
    name: String,
    dir: PathBuf,
    options: QueueOptions,
    guard: Mutex<()>,
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> QueueError {
    QueueError::Unavailable(format!("{op} {}: {e}", path.display()))
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_default()
}

impl FileQueue {
    /// Open (and create if needed) the queue directory `<root>/<name>`.
    pub async fn open(
        root: impl AsRef<Path>,
        name: impl Into<String>,
        options: QueueOptions,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        let dir = root.as_ref().join(&name);
        let dead = dir.join(DEAD_DIR);
        fs::create_dir_all(&dead)
            .await
            .map_err(|e| io_error("create dir", &dead, e))?;
        Ok(Self {
            name,
            dir,
            options,
            guard: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn message_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{file_name}.{}.tmp", Uuid::now_v7()));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error("rename", path, e));
        }
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<StoredMessage>, QueueError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", path, e)),
        }
    }

    async fn write(&self, stored: &StoredMessage) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(stored)?;
        Self::write_atomic(&self.message_path(&stored.message.id), &bytes).await
    }

    async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| io_error("list", dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Load the message a receipt refers to, if its lease is still live.
    async fn leased(&self, receipt: &Receipt) -> Result<StoredMessage, QueueError> {
        let not_found = || QueueError::ReceiptNotFound(receipt.message_id().to_string());
        let stored = self
            .read(&self.message_path(receipt.message_id()))
            .await?
            .ok_or_else(not_found)?;
        if stored.lease != Some(receipt.token()) || stored.visible_after <= Utc::now() {
            return Err(not_found());
        }
        Ok(stored)
    }

    /// Move an unreadable file out of the scan set as `<file>.corrupt`.
    async fn quarantine(&self, path: &Path, reason: &str) -> Result<(), QueueError> {
        let target = path.with_extension("json.corrupt");
        warn!(
            queue = %self.name,
            file = %path.display(),
            error = reason,
            "unreadable queue file quarantined"
        );
        match fs::rename(path, &target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("quarantine", path, e)),
        }
    }

    async fn try_take(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let _guard = self.guard.lock().await;
        let now = Utc::now();

        let mut ready: Option<StoredMessage> = None;
        for path in Self::json_files(&self.dir).await? {
            let stored = match self.read(&path).await {
                Ok(Some(stored)) => stored,
                // Acked between listing and reading.
                Ok(None) => continue,
                Err(QueueError::Serialization(reason)) => {
                    self.quarantine(&path, &reason).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if stored.visible_after > now {
                continue;
            }
            let earlier = ready.as_ref().is_none_or(|r| {
                (stored.visible_after, stored.message.enqueued_at)
                    < (r.visible_after, r.message.enqueued_at)
            });
            if earlier {
                ready = Some(stored);
            }
        }

        let Some(mut stored) = ready else {
            return Ok(None);
        };
        stored.delivery_count += 1;

        if stored.delivery_count > self.options.max_delivery_count {
            let entry = DeadLetterEntry::new(stored.message.clone(), stored.delivery_count);
            let dead_path = self.dir.join(DEAD_DIR).join(format!(
                "{}-{}.json",
                entry.dead_lettered_at.timestamp_millis(),
                entry.message.id
            ));
            Self::write_atomic(&dead_path, &serde_json::to_vec(&entry)?).await?;
            let path = self.message_path(&stored.message.id);
            fs::remove_file(&path)
                .await
                .map_err(|e| io_error("remove", &path, e))?;
            warn!(
                queue = %self.name,
                message_id = %entry.message.id,
                delivery_count = entry.delivery_count,
                "message dead-lettered"
            );
            return Err(QueueError::DeadLettered {
                message: Box::new(entry.message),
                delivery_count: entry.delivery_count,
            });
        }

        let token = Uuid::now_v7();
        stored.lease = Some(token);
        stored.visible_after = after(now, visibility_timeout);
        self.write(&stored).await?;

        Ok(Some(Delivery {
            receipt: Receipt::new(stored.message.id.clone(), token),
            delivery_count: stored.delivery_count,
            message: stored.message,
        }))
    }
}

#[async_trait]
impl MessageQueue for FileQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, message), fields(queue = %self.name, message_id = %message.id), err)]
    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<EnqueueOutcome, QueueError> {
        let _guard = self.guard.lock().await;
        if self.read(&self.message_path(&message.id)).await?.is_some() {
            debug!("message already pending");
            return Ok(EnqueueOutcome::AlreadyPending);
        }
        let stored = StoredMessage {
            visible_after: after(Utc::now(), delay),
            message,
            delivery_count: 0,
            lease: None,
        };
        self.write(&stored).await?;
        Ok(EnqueueOutcome::Queued)
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.options.poll_interval;
        let scan_interval = self.options.poll_interval.min(MAX_SCAN_INTERVAL);
        loop {
            if let Some(delivery) = self.try_take(visibility_timeout).await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(scan_interval.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let _guard = self.guard.lock().await;
        self.leased(receipt).await?;
        let path = self.message_path(receipt.message_id());
        fs::remove_file(&path)
            .await
            .map_err(|e| io_error("remove", &path, e))
    }

    async fn requeue(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        let _guard = self.guard.lock().await;
        let mut stored = self.leased(receipt).await?;
        stored.lease = None;
        stored.visible_after = after(Utc::now(), delay);
        self.write(&stored).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let dead_dir = self.dir.join(DEAD_DIR);
        let mut entries = Vec::new();
        for path in Self::json_files(&dead_dir).await? {
            let bytes = fs::read(&path)
                .await
                .map_err(|e| io_error("read", &path, e))?;
            match serde_json::from_slice::<DeadLetterEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    queue = %self.name,
                    file = %path.display(),
                    error = %e,
                    "skipping unreadable dead-letter entry"
                ),
            }
        }
        entries.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        entries.truncate(limit);
        Ok(entries)
    }
}

/// Opens one [`FileQueue`] per step under a shared root directory.
#[derive(Debug)]
pub struct FileQueueBackend {
    root: PathBuf,
    prefix: String,
    options: QueueOptions,
    opened: StdMutex<HashMap<StepName, Arc<FileQueue>>>,
}

impl FileQueueBackend {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
            options,
            opened: StdMutex::new(HashMap::new()),
        }
    }

    fn cached(&self, step: &StepName) -> Option<Arc<FileQueue>> {
        self.opened.lock().ok()?.get(step).cloned()
    }
}

#[async_trait]
impl QueueBackend for FileQueueBackend {
    async fn open(&self, step: &StepName) -> Result<Arc<dyn MessageQueue>, QueueError> {
        // Queues opened twice must share the process-local mutex.
        if let Some(queue) = self.cached(step) {
            let queue: Arc<dyn MessageQueue> = queue;
            return Ok(queue);
        }
        let opened = Arc::new(
            FileQueue::open(&self.root, format!("{}.{step}", self.prefix), self.options).await?,
        );
        let mut map = self
            .opened
            .lock()
            .map_err(|_| QueueError::Unavailable("queue registry lock poisoned".to_string()))?;
        let queue: Arc<dyn MessageQueue> = map.entry(step.clone()).or_insert(opened).clone();
        Ok(queue)
    }
}
