//! In-memory queue backed by the tokio clock.
//!
//! Visibility times use `tokio::time::Instant`, so tests can drive leases and
//! backoff with `tokio::time::pause()`/`advance()`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use docpipe_core::StepName;

use super::{
    DeadLetterEntry, Delivery, EnqueueOutcome, MessageQueue, QueueBackend, QueueError,
    QueueMessage, QueueOptions, Receipt,
};

#[derive(Debug)]
struct Entry {
    message: QueueMessage,
    delivery_count: u32,
    visible_at: Instant,
    lease: Option<Uuid>,
    /// Insertion order, breaks ties between equal visibility times.
    seq: u64,
}

/// Dead letters kept per queue; the oldest are dropped beyond this.
pub const DEAD_LETTER_CAPACITY: usize = 1_000;

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    dead: VecDeque<DeadLetterEntry>,
    next_seq: u64,
}

enum Take {
    Leased(Delivery),
    Dead(DeadLetterEntry),
    /// Nothing visible; earliest time something becomes visible.
    Empty(Option<Instant>),
}

#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    options: QueueOptions,
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Messages still in the queue (ready or leased).
    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Snapshot of pending message ids, for assertions.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .map(|s| s.entries.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable(format!("queue {} lock poisoned", self.name)))
    }

    fn try_take(&self, visibility_timeout: Duration) -> Result<Take, QueueError> {
        let now = Instant::now();
        let mut state = self.lock()?;

        let ready = state
            .entries
            .values()
            .filter(|e| e.visible_at <= now)
            .min_by_key(|e| (e.visible_at, e.seq))
            .map(|e| e.message.id.clone());

        let Some(id) = ready else {
            let next = state.entries.values().map(|e| e.visible_at).min();
            return Ok(Take::Empty(next));
        };

        let max = self.options.max_delivery_count;
        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(Take::Empty(None));
        };
        entry.delivery_count += 1;

        if entry.delivery_count > max {
            let count = entry.delivery_count;
            let Some(entry) = state.entries.remove(&id) else {
                return Ok(Take::Empty(None));
            };
            let dead = DeadLetterEntry::new(entry.message, count);
            if state.dead.len() == DEAD_LETTER_CAPACITY {
                state.dead.pop_front();
            }
            state.dead.push_back(dead.clone());
            return Ok(Take::Dead(dead));
        }

        let token = Uuid::now_v7();
        entry.lease = Some(token);
        entry.visible_at = now + visibility_timeout;
        Ok(Take::Leased(Delivery {
            message: entry.message.clone(),
            receipt: Receipt::new(id, token),
            delivery_count: entry.delivery_count,
        }))
    }

    /// Find the entry a receipt refers to, if its lease is still live.
    fn leased_entry<'a>(
        state: &'a mut State,
        receipt: &Receipt,
        now: Instant,
    ) -> Result<&'a mut Entry, QueueError> {
        match state.entries.get_mut(receipt.message_id()) {
            Some(e) if e.lease == Some(receipt.token()) && e.visible_at > now => Ok(e),
            _ => Err(QueueError::ReceiptNotFound(
                receipt.message_id().to_string(),
            )),
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<EnqueueOutcome, QueueError> {
        {
            let mut state = self.lock()?;
            if state.entries.contains_key(&message.id) {
                debug!(queue = %self.name, message_id = %message.id, "message already pending");
                return Ok(EnqueueOutcome::AlreadyPending);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(
                message.id.clone(),
                Entry {
                    message,
                    delivery_count: 0,
                    visible_at: Instant::now() + delay,
                    lease: None,
                    seq,
                },
            );
        }
        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Queued)
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + self.options.poll_interval;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.try_take(visibility_timeout)? {
                Take::Leased(delivery) => return Ok(Some(delivery)),
                Take::Dead(dead) => {
                    warn!(
                        queue = %self.name,
                        message_id = %dead.message.id,
                        delivery_count = dead.delivery_count,
                        "message dead-lettered"
                    );
                    return Err(QueueError::DeadLettered {
                        message: Box::new(dead.message),
                        delivery_count: dead.delivery_count,
                    });
                }
                Take::Empty(next) => next.map_or(deadline, |t| t.min(deadline)),
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        Self::leased_entry(&mut state, receipt, Instant::now())?;
        state.entries.remove(receipt.message_id());
        Ok(())
    }

    async fn requeue(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let now = Instant::now();
            let entry = Self::leased_entry(&mut state, receipt, now)?;
            entry.lease = None;
            entry.visible_at = now + delay;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.lock()?;
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }
}

/// Hands out one shared [`InMemoryQueue`] per step.
#[derive(Debug, Default)]
pub struct InMemoryQueueBackend {
    prefix: String,
    options: QueueOptions,
    queues: Mutex<HashMap<StepName, Arc<InMemoryQueue>>>,
}

impl InMemoryQueueBackend {
    pub fn new(prefix: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            prefix: prefix.into(),
            options,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// The concrete queue for `step`, created on first use.
    pub fn queue(&self, step: &StepName) -> Result<Arc<InMemoryQueue>, QueueError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| QueueError::Unavailable("queue registry lock poisoned".to_string()))?;
        let queue = queues.entry(step.clone()).or_insert_with(|| {
            Arc::new(InMemoryQueue::new(
                format!("{}.{step}", self.prefix),
                self.options,
            ))
        });
        Ok(queue.clone())
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn open(&self, step: &StepName) -> Result<Arc<dyn MessageQueue>, QueueError> {
        let queue: Arc<dyn MessageQueue> = self.queue(step)?;
        Ok(queue)
    }
}
