//! Message broker abstraction.
//!
//! Two delivery modes share one trait:
//! - queues are competing-consumer: each message reaches exactly one
//!   `consume` subscription, and messages wait while nobody consumes;
//! - channels are broadcast: each message reaches every `subscribe`
//!   subscription active at publish time, and is dropped otherwise.
//!
//! Implementations: [`MemoryBroker`] (in-process) and [`PostgresBroker`]
//! (pgmq queues plus LISTEN/NOTIFY channels).

pub mod memory;
pub mod postgres;

pub use memory::MemoryBroker;
pub use postgres::{PostgresBroker, PostgresConfig};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the background error stream.
pub(crate) const ERROR_CAPACITY: usize = 64;

/// A live receive loop on one queue or channel.
///
/// Dropping a subscription releases it; the broker itself stays open.
///
/// `recv` and `try_recv` are cancel-safe: if the future is dropped after a
/// message was taken from the broker, the message is kept and returned by
/// the next call or by [`Subscription::settle`].
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message. `None` once the broker is closed.
    async fn recv(&mut self) -> Option<Result<Vec<u8>>>;

    /// Return a message only if one is immediately available.
    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// Finish a receive that was cancelled part way, without starting a new one.
    ///
    /// Call before dropping a subscription whose `recv` lost a `select!`.
    async fn settle(&mut self) -> Option<Result<Vec<u8>>> {
        None
    }
}

/// Transport shared by every worker and control loop of a pool.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Short name for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Send to a competing-consumer queue.
    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Send to every current subscriber of a broadcast channel.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>>;

    /// Start listening on a broadcast channel.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>>;

    /// Add `member` to the set `key` and refresh the whole set's expiry.
    async fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<()>;

    /// Unexpired members of the set `key`, sorted.
    async fn members(&self, key: &str) -> Result<Vec<String>>;

    /// Errors raised by background broker tasks.
    fn errors(&self) -> broadcast::Receiver<String>;

    /// End every subscription and release connections. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
