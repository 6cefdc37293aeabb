//! Redis-backed store client used by every pipeline stage.
//!
//! Writes share one auto-reconnecting multiplexed connection and pass
//! through the retry/breaker gate. Stream reads and pub/sub subscriptions
//! are long-lived blocking calls, so each consumer owns a dedicated
//! connection and neither retries nor trips the breaker; their errors are
//! handled by the consumer loops.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::time::timeout;

use tickline_telemetry::PipelineMetrics;

use crate::backoff::RetryPolicy;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::StoreError;

/// Per-attempt deadline for stream appends and hash writes.
const WRITE_DEADLINE: Duration = Duration::from_millis(100);
/// Per-attempt deadline for bare publishes.
const PUBLISH_DEADLINE: Duration = Duration::from_millis(50);
/// Deadline for the batched latest-quote write.
const BATCH_DEADLINE: Duration = Duration::from_millis(100);

pub type StoreResult<T> = Result<T, StoreError>;

/// One decoded entry read from an append-only stream.
#[derive(Clone, Debug)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Shared store client. Cheap to clone via `Arc`.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl RedisStore {
    pub async fn connect(url: &str, metrics: Arc<PipelineMetrics>) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            retry: RetryPolicy::default(),
            metrics,
        })
    }

    /// Appends a field map to an append-only stream (`XADD <stream> *`).
    pub async fn append(&self, stream: &str, fields: &[(&'static str, String)]) -> StoreResult<()> {
        let stream = stream.to_string();
        let fields = fields.to_vec();
        self.run_guarded("xadd", WRITE_DEADLINE, self.retry.max_retries, move |mut conn| {
            let stream = stream.clone();
            let fields = fields.clone();
            async move {
                let mut cmd = redis::cmd("XADD");
                cmd.arg(&stream).arg("*");
                for (name, value) in &fields {
                    cmd.arg(*name).arg(value);
                }
                cmd.query_async::<_, String>(&mut conn).await.map(|_| ())
            }
        })
        .await
    }

    /// Sets hash fields (`HSET <key>`).
    pub async fn hset(&self, key: &str, fields: &[(&'static str, String)]) -> StoreResult<()> {
        let key = key.to_string();
        let fields = fields.to_vec();
        self.run_guarded("hset", WRITE_DEADLINE, self.retry.max_retries, move |mut conn| {
            let key = key.clone();
            let fields = fields.clone();
            async move {
                let mut cmd = redis::cmd("HSET");
                cmd.arg(&key);
                for (name, value) in &fields {
                    cmd.arg(*name).arg(value);
                }
                cmd.query_async::<_, ()>(&mut conn).await
            }
        })
        .await
    }

    /// Publishes a payload on a pub/sub channel. Short deadline, no retry:
    /// subscribers tolerate gaps, stale delivery is worse than none.
    pub async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let channel = channel.to_string();
        let payload = payload.to_string();
        self.run_guarded("publish", PUBLISH_DEADLINE, 0, move |mut conn| {
            let channel = channel.clone();
            let payload = payload.clone();
            async move {
                redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(&payload)
                    .query_async::<_, i64>(&mut conn)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    /// Hash write plus broadcast as one pipelined round-trip, the publisher's
    /// per-tick batch.
    pub async fn hset_publish(
        &self,
        key: &str,
        fields: &[(&'static str, String)],
        channel: &str,
        payload: &str,
    ) -> StoreResult<()> {
        let key = key.to_string();
        let fields = fields.to_vec();
        let channel = channel.to_string();
        let payload = payload.to_string();
        self.run_guarded("pipeline", BATCH_DEADLINE, 0, move |mut conn| {
            let key = key.clone();
            let fields = fields.clone();
            let channel = channel.clone();
            let payload = payload.clone();
            async move {
                let mut hset = redis::cmd("HSET");
                hset.arg(&key);
                for (name, value) in &fields {
                    hset.arg(*name).arg(value);
                }
                let mut pipe = redis::pipe();
                pipe.add_command(hset).ignore();
                pipe.cmd("PUBLISH").arg(&channel).arg(&payload).ignore();
                pipe.query_async::<_, ()>(&mut conn).await
            }
        })
        .await
    }

    /// Adds a member to an ordered set (`ZADD <key> <score> <member>`).
    /// Pass-through apart from the deadline; the caller owns error policy.
    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let write = async {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await
        };
        let result = match timeout(WRITE_DEADLINE, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(StoreError::Redis(err)),
            Err(_) => Err(StoreError::Timeout(WRITE_DEADLINE)),
        };
        self.metrics
            .observe_redis_op("zadd", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    /// Opens a cursor over an append-only stream on a dedicated connection;
    /// `XREAD BLOCK` occupies the connection for the block window.
    pub async fn stream_reader(
        &self,
        stream: &str,
        batch_size: usize,
        block: Duration,
    ) -> StoreResult<StreamReader> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(StreamReader {
            conn,
            stream: stream.to_string(),
            cursor: StreamReader::START.to_string(),
            count: batch_size,
            block,
        })
    }

    /// Subscribes to a pub/sub channel on a dedicated connection.
    pub async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(Subscription {
            messages: Box::pin(pubsub.into_on_message()),
        })
    }

    async fn run_guarded<F, Fut>(
        &self,
        operation: &'static str,
        deadline: Duration,
        max_retries: u32,
        mut op: F,
    ) -> StoreResult<()>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<()>>,
    {
        let start = Instant::now();
        let result = self.attempt_loop(deadline, max_retries, &mut op).await;
        self.metrics
            .observe_redis_op(operation, result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    async fn attempt_loop<F, Fut>(
        &self,
        deadline: Duration,
        max_retries: u32,
        op: &mut F,
    ) -> StoreResult<()>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<()>>,
    {
        if !self.breaker.allow() {
            return Err(StoreError::CircuitOpen);
        }

        let mut attempt = 0u32;
        loop {
            let outcome = match timeout(deadline, op(self.conn.clone())).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(StoreError::Redis(err)),
                Err(_) => Err(StoreError::Timeout(deadline)),
            };

            match outcome {
                Ok(()) => {
                    self.breaker.record_success();
                    return Ok(());
                }
                Err(err) => {
                    self.breaker.record_failure();
                    if attempt >= max_retries {
                        return Err(err);
                    }
                    if !self.breaker.allow() {
                        return Err(StoreError::CircuitOpen);
                    }
                    tokio::time::sleep(self.retry.backoff.delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Clone for RedisStore {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            conn: self.conn.clone(),
            breaker: self.breaker.clone(),
            retry: self.retry,
            metrics: self.metrics.clone(),
        }
    }
}

/// Blocking cursor over one append-only stream.
///
/// The cursor is a low-water mark of "seen": consumers advance it per
/// message before doing any work, so a crash replays at-least-once from the
/// last advanced id. It is never persisted; restarts begin at the stream
/// head.
pub struct StreamReader {
    conn: redis::aio::MultiplexedConnection,
    stream: String,
    cursor: String,
    count: usize,
    block: Duration,
}

impl StreamReader {
    /// Identifier addressing the beginning of a stream.
    pub const START: &'static str = "0-0";

    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    /// Advances the low-water mark past `id`.
    pub fn advance(&mut self, id: &str) {
        self.cursor = id.to_string();
    }

    /// Reads up to `count` entries after the cursor, waiting up to the block
    /// window. An empty result means the wait elapsed.
    pub async fn read_batch(&mut self) -> StoreResult<Vec<StreamEntry>> {
        let options = StreamReadOptions::default()
            .count(self.count)
            .block(self.block.as_millis() as usize);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.stream.as_str()], &[self.cursor.as_str()], &options)
            .await?;

        let mut entries = Vec::new();
        let Some(reply) = reply else {
            return Ok(entries);
        };
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());
                for (name, value) in id.map {
                    let text: String = redis::from_redis_value(&value)?;
                    fields.insert(name, text);
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }
}

/// Live pub/sub subscription; yields `None` once the broker closes it.
pub struct Subscription {
    messages: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

impl Subscription {
    pub async fn next_payload(&mut self) -> Option<StoreResult<String>> {
        let msg = self.messages.next().await?;
        Some(msg.get_payload::<String>().map_err(StoreError::from))
    }
}
