//! Redis-backed queue for workers spread over several hosts.
//!
//! ## Keys (per queue, `<prefix>` = queue name)
//!
//! - `<prefix>:ready`: sorted set, member = message id, score = visible-at
//!   (unix millis). Leased messages stay in the set with score = lease expiry,
//!   so an expired lease is simply visible again.
//! - `<prefix>:msgs`: hash, message id → message JSON
//! - `<prefix>:deliveries`: hash, message id → delivery count
//! - `<prefix>:leases`: hash, message id → current lease token
//! - `<prefix>:dead`: list of dead-letter entries (JSON), newest first
//!
//! Lease, acknowledge and requeue are Lua scripts so each is atomic. The
//! current time is passed in by the caller rather than read from the server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use docpipe_core::StepName;

use super::{
    DeadLetterEntry, Delivery, EnqueueOutcome, MessageQueue, QueueBackend, QueueError,
    QueueMessage, QueueOptions, Receipt,
};

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[1], 0)
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

const DEQUEUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
local id = ids[1]
local body = redis.call('HGET', KEYS[2], id)
local count = redis.call('HINCRBY', KEYS[3], id, 1)
if count > tonumber(ARGV[4]) then
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  redis.call('HDEL', KEYS[4], id)
  return {'dead', body, count}
end
redis.call('ZADD', KEYS[1], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
redis.call('HSET', KEYS[4], id, ARGV[3])
return {'leased', body, count}
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
  return 0
end
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) <= tonumber(ARGV[3]) then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

const REQUEUE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
  return 0
end
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) <= tonumber(ARGV[3]) then
  return 0
end
redis.call('ZADD', KEYS[1], tonumber(ARGV[3]) + tonumber(ARGV[4]), ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

fn command_error(op: &str, e: redis::RedisError) -> QueueError {
    QueueError::Unavailable(format!("redis {op} failed: {e}"))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct RedisQueue {
    name: String,
    conn: MultiplexedConnection,
    options: QueueOptions,
    ready_key: String,
    msgs_key: String,
    deliveries_key: String,
    leases_key: String,
    dead_key: String,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl RedisQueue {
    pub fn new(conn: MultiplexedConnection, name: impl Into<String>, options: QueueOptions) -> Self {
        let name = name.into();
        Self {
            ready_key: format!("{name}:ready"),
            msgs_key: format!("{name}:msgs"),
            deliveries_key: format!("{name}:deliveries"),
            leases_key: format!("{name}:leases"),
            dead_key: format!("{name}:dead"),
            name,
            conn,
            options,
        }
    }

    fn script<'a>(&'a self, script: &'a Script) -> redis::ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&self.ready_key)
            .key(&self.msgs_key)
            .key(&self.deliveries_key)
            .key(&self.leases_key);
        invocation
    }

    async fn try_take(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let token = Uuid::now_v7();
        let script = Script::new(DEQUEUE_SCRIPT);
        let taken: Option<(String, String, u32)> = self
            .script(&script)
            .arg(now_ms())
            .arg(millis(visibility_timeout))
            .arg(token.to_string())
            .arg(self.options.max_delivery_count)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("dequeue", e))?;

        let Some((state, body, delivery_count)) = taken else {
            return Ok(None);
        };
        let message: QueueMessage = serde_json::from_str(&body)?;

        if state == "dead" {
            let entry = DeadLetterEntry::new(message, delivery_count);
            redis::cmd("LPUSH")
                .arg(&self.dead_key)
                .arg(serde_json::to_string(&entry)?)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| command_error("dead-letter", e))?;
            warn!(
                queue = %self.name,
                message_id = %entry.message.id,
                delivery_count,
                "message dead-lettered"
            );
            return Err(QueueError::DeadLettered {
                message: Box::new(entry.message),
                delivery_count,
            });
        }

        Ok(Some(Delivery {
            receipt: Receipt::new(message.id.clone(), token),
            message,
            delivery_count,
        }))
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, message), fields(queue = %self.name, message_id = %message.id), err)]
    async fn enqueue(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let script = Script::new(ENQUEUE_SCRIPT);
        let added: i64 = self
            .script(&script)
            .arg(&message.id)
            .arg(serde_json::to_string(&message)?)
            .arg(now_ms() + millis(delay))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("enqueue", e))?;

        if added == 1 {
            Ok(EnqueueOutcome::Queued)
        } else {
            debug!("message already pending");
            Ok(EnqueueOutcome::AlreadyPending)
        }
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.options.poll_interval;
        let scan_interval = self.options.poll_interval.min(Duration::from_millis(100));
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
        let mut conn = self.conn.clone();
        let script = Script::new(ACK_SCRIPT);
        let removed: i64 = self
            .script(&script)
            .arg(receipt.message_id())
            .arg(receipt.token().to_string())
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("acknowledge", e))?;
        if removed == 1 {
            Ok(())
        } else {
            Err(QueueError::ReceiptNotFound(receipt.message_id().to_string()))
        }
    }

    async fn requeue(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let script = Script::new(REQUEUE_SCRIPT);
        let released: i64 = self
            .script(&script)
            .arg(receipt.message_id())
            .arg(receipt.token().to_string())
            .arg(now_ms())
            .arg(millis(delay))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("requeue", e))?;
        if released == 1 {
            Ok(())
        } else {
            Err(QueueError::ReceiptNotFound(receipt.message_id().to_string()))
        }
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.dead_key)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("LRANGE", e))?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(QueueError::from))
            .collect()
    }
}

/// Opens [`RedisQueue`]s sharing one multiplexed connection.
pub struct RedisQueueBackend {
    conn: MultiplexedConnection,
    prefix: String,
    options: QueueOptions,
    opened: Mutex<HashMap<StepName, Arc<RedisQueue>>>,
}

impl RedisQueueBackend {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        options: QueueOptions,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Unavailable(format!("redis connection error: {e}")))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| QueueError::Unavailable(format!("redis connection error: {e}")))?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            options,
            opened: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn open(&self, step: &StepName) -> Result<Arc<dyn MessageQueue>, QueueError> {
        let mut opened = self
            .opened
            .lock()
            .map_err(|_| QueueError::Unavailable("queue registry lock poisoned".to_string()))?;
        let queue = opened
            .entry(step.clone())
            .or_insert_with(|| {
                Arc::new(RedisQueue::new(
                    self.conn.clone(),
                    format!("{}:{step}", self.prefix),
                    self.options,
                ))
            })
            .clone();
        let queue: Arc<dyn MessageQueue> = queue;
        Ok(queue)
    }
}
