//! Postgres-backed broker.
//!
//! - Queues are pgmq queues. A consumer reads one message with a visibility
//!   timeout and archives it straight away, so each message is handed to one
//!   consumer. Empty queues are polled on an interval.
//! - Broadcast channels use LISTEN/NOTIFY. The payload is stored in
//!   `runner_broadcasts` and the notification carries only its row id.
//! - Membership sets live in `runner_members`.
//!
//! Each channel subscription holds its own listener connection from the
//! pool, so size `max_connections` for the number of concurrent subscribers.

use super::{Broker, ERROR_CAPACITY, Subscription};
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use base64::prelude::*;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Postgres truncates longer identifiers, which would split LISTEN and NOTIFY.
const MAX_CHANNEL_LEN: usize = 63;

/// Prune stored broadcast payloads once per this many publishes.
const PRUNE_EVERY: u64 = 256;

/// Connection and polling settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    /// Visibility timeout (seconds) for pgmq reads.
    pub visibility_timeout: i32,
    /// How often an idle queue consumer polls.
    pub poll_interval: Duration,
    /// How long broadcast payloads are kept for late fetches.
    pub broadcast_retention: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            visibility_timeout: 30,
            poll_interval: Duration::from_millis(500),
            broadcast_retention: Duration::from_secs(600),
        }
    }
}

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub message: serde_json::Value,
}

/// Wrap raw bytes for a jsonb queue column.
///
/// JSON payloads travel as `{"body": ...}`. Anything else travels as
/// `{"raw": "<base64>"}`, byte for byte, so malformed work items still reach
/// a worker and get a result.
pub fn seal_envelope(payload: &[u8]) -> serde_json::Value {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(body) => serde_json::json!({ "body": body }),
        Err(_) => serde_json::json!({ "raw": BASE64_STANDARD.encode(payload) }),
    }
}

/// Recover the bytes sealed by [`seal_envelope`].
pub fn open_envelope(message: serde_json::Value) -> Result<Vec<u8>> {
    let serde_json::Value::Object(mut fields) = message else {
        return Err(Error::Other("queue message is not an envelope object".to_string()));
    };
    if let Some(body) = fields.remove("body") {
        return Ok(serde_json::to_vec(&body)?);
    }
    match fields.remove("raw") {
        Some(serde_json::Value::String(raw)) => BASE64_STANDARD
            .decode(raw)
            .map_err(|e| Error::Other(format!("queue envelope raw payload: {e}"))),
        _ => Err(Error::Other("queue envelope has neither body nor raw".to_string())),
    }
}

fn validate_channel(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidChannel {
            name: name.to_string(),
            reason: "empty".to_string(),
        });
    }
    if name.len() > MAX_CHANNEL_LEN {
        return Err(Error::InvalidChannel {
            name: name.to_string(),
            reason: format!("longer than {MAX_CHANNEL_LEN} bytes"),
        });
    }
    Ok(())
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Broker handle. Owns the connection pool shared by every subscription.
pub struct PostgresBroker {
    pool: PgPool,
    config: PostgresConfig,
    closed: watch::Sender<bool>,
    errors: broadcast::Sender<String>,
    published: AtomicU64,
}

impl PostgresBroker {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, config: PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;
        info!(
            max_connections = config.max_connections,
            "connected to postgres broker"
        );
        let (closed, _) = watch::channel(false);
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        Ok(Self {
            pool,
            config,
            closed,
            errors,
            published: AtomicU64::new(0),
        })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        metrics::record_broker_operation(self.kind(), "create");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::BrokerClosed)
        } else {
            Ok(())
        }
    }

    async fn prune_broadcasts(&self) {
        let retention = self.config.broadcast_retention.as_secs_f64();
        let pruned = sqlx::query(
            "DELETE FROM runner_broadcasts WHERE published_at < now() - make_interval(secs => $1)",
        )
        .bind(retention)
        .execute(&self.pool)
        .await;
        match pruned {
            Ok(done) => debug!(rows = done.rows_affected(), "pruned broadcast payloads"),
            Err(e) => {
                warn!("pruning broadcast payloads failed: {e}");
                let _ = self.errors.send(format!("prune broadcasts: {e}"));
            }
        }
    }
}

/// Read the next visible message and archive it, claiming it for the caller.
async fn claim_message(
    pool: &PgPool,
    queue: &str,
    vt_seconds: i32,
) -> Result<Option<PgmqMessage>> {
    let row = sqlx::query_as::<_, (i64, i32, serde_json::Value)>(
        "SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)",
    )
    .bind(queue)
    .bind(vt_seconds)
    .fetch_optional(pool)
    .await?;

    let Some((msg_id, read_ct, message)) = row else {
        metrics::record_broker_operation("postgres", "read_empty");
        return Ok(None);
    };

    // Archive keeps an audit trail; false means another consumer got there
    // first after our visibility timeout lapsed.
    let (archived,): (bool,) = sqlx::query_as("SELECT pgmq.archive($1, $2)")
        .bind(queue)
        .bind(msg_id)
        .fetch_one(pool)
        .await?;
    if !archived {
        debug!(queue, msg_id, "message claimed elsewhere");
        return Ok(None);
    }
    metrics::record_broker_operation("postgres", "read");

    Ok(Some(PgmqMessage {
        msg_id,
        read_ct,
        message,
    }))
}

/// Claim one message and unwrap its envelope.
async fn claim_payload(pool: PgPool, queue: String, vt_seconds: i32) -> Result<Option<Vec<u8>>> {
    let Some(msg) = claim_message(&pool, &queue, vt_seconds).await? else {
        return Ok(None);
    };
    if msg.read_ct > 1 {
        debug!(
            queue = %queue,
            msg_id = msg.msg_id,
            read_ct = msg.read_ct,
            "redelivered message"
        );
    }
    open_envelope(msg.message).map(Some)
}

type ClaimTask = JoinHandle<Result<Option<Vec<u8>>>>;

struct QueueSubscription {
    pool: PgPool,
    queue: String,
    visibility_timeout: i32,
    poll_interval: Duration,
    closed: watch::Receiver<bool>,
    /// Read-then-archive runs in its own task so a cancelled caller does not
    /// lose a message that was already archived.
    claiming: Option<ClaimTask>,
}

impl QueueSubscription {
    async fn claim(&mut self) -> Result<Option<Vec<u8>>> {
        let (pool, queue, vt) = (
            self.pool.clone(),
            self.queue.clone(),
            self.visibility_timeout,
        );
        let task = self
            .claiming
            .get_or_insert_with(|| tokio::spawn(claim_payload(pool, queue, vt)));
        let joined = task.await;
        self.claiming = None;
        joined.map_err(|e| Error::Other(format!("claim on {} failed: {e}", self.queue)))?
    }
}

#[async_trait]
impl Subscription for QueueSubscription {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            if self.claiming.is_none() && *self.closed.borrow() {
                return None;
            }
            match self.claim().await {
                Ok(Some(payload)) => return Some(Ok(payload)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
            tokio::select! {
                _ = wait_closed(&mut self.closed) => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.claiming.is_none() && *self.closed.borrow() {
            return Ok(None);
        }
        self.claim().await
    }

    async fn settle(&mut self) -> Option<Result<Vec<u8>>> {
        self.claiming.as_ref()?;
        self.claim().await.transpose()
    }
}

struct ChannelSubscription {
    pool: PgPool,
    channel: String,
    listener: PgListener,
    closed: watch::Receiver<bool>,
    errors: broadcast::Sender<String>,
    /// Notification payload id taken off the listener but not yet fetched.
    pending: Option<String>,
}

impl ChannelSubscription {
    async fn fetch(&self, payload_id: &str) -> Result<Vec<u8>> {
        let id: i64 = payload_id.parse().map_err(|_| {
            Error::Other(format!("bad notification on {}: {payload_id:?}", self.channel))
        })?;
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT payload FROM runner_broadcasts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(payload,)| payload).ok_or_else(|| {
            Error::Other(format!("broadcast {id} on {} pruned before delivery", self.channel))
        })
    }

    /// Fetch the payload for a notification already taken off the listener.
    ///
    /// The id stays in `pending` until the fetch completes, so a cancelled
    /// fetch is retried by the next call.
    async fn fetch_pending(&mut self) -> Option<Result<Vec<u8>>> {
        let payload_id = self.pending.clone()?;
        let fetched = self.fetch(&payload_id).await;
        self.pending = None;
        Some(fetched)
    }
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        if let Some(fetched) = self.fetch_pending().await {
            return Some(fetched);
        }
        let notification = tokio::select! {
            biased;
            n = self.listener.recv() => n,
            _ = wait_closed(&mut self.closed) => return None,
        };
        match notification {
            Ok(n) => {
                self.pending = Some(n.payload().to_string());
                self.fetch_pending().await
            }
            Err(e) => {
                let _ = self.errors.send(format!("listener on {}: {e}", self.channel));
                Some(Err(e.into()))
            }
        }
    }

    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pending.is_none() {
            match self.listener.next_buffered() {
                Some(n) => self.pending = Some(n.payload().to_string()),
                None => return Ok(None),
            }
        }
        self.fetch_pending().await.transpose()
    }

    async fn settle(&mut self) -> Option<Result<Vec<u8>>> {
        self.fetch_pending().await
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let _: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue)
            .bind(seal_envelope(payload))
            .bind(0i32)
            .fetch_one(&self.pool)
            .await?;
        metrics::record_broker_operation(self.kind(), "enqueue");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate_channel(channel)?;
        sqlx::query(
            "WITH stored AS (
                 INSERT INTO runner_broadcasts (channel, payload) VALUES ($1, $2) RETURNING id
             )
             SELECT pg_notify($1, id::text) FROM stored",
        )
        .bind(channel)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        metrics::record_broker_operation(self.kind(), "publish");

        if self.published.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune_broadcasts().await;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        Ok(Box::new(QueueSubscription {
            pool: self.pool.clone(),
            queue: queue.to_string(),
            visibility_timeout: self.config.visibility_timeout,
            poll_interval: self.config.poll_interval,
            closed: self.closed.subscribe(),
            claiming: None,
        }))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        validate_channel(channel)?;
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        debug!(channel, "listening");
        Ok(Box::new(ChannelSubscription {
            pool: self.pool.clone(),
            channel: channel.to_string(),
            listener,
            closed: self.closed.subscribe(),
            errors: self.errors.clone(),
            pending: None,
        }))
    }

    async fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let ttl = ttl.as_secs_f64();
        let mut tx = self.pool.begin().await?;

        // An expired set starts over, like a key that timed out.
        sqlx::query("DELETE FROM runner_members WHERE set_key = $1 AND expires_at <= now()")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO runner_members (set_key, member, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (set_key, member) DO NOTHING",
        )
        .bind(key)
        .bind(member)
        .bind(ttl)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE runner_members SET expires_at = now() + make_interval(secs => $2)
             WHERE set_key = $1",
        )
        .bind(key)
        .bind(ttl)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::record_broker_operation(self.kind(), "add_member");
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT member FROM runner_members
             WHERE set_key = $1 AND expires_at > now()
             ORDER BY member",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(member,)| member).collect())
    }

    fn errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Waits for subscriptions to hand their connections back.
        self.pool.close().await;
        info!("postgres broker closed");
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
