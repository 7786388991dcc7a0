//! In-process broker built on tokio channels.
//!
//! Queues are unbounded mpsc channels whose receiver is shared behind an
//! async mutex, so concurrent consumers compete for each message. Channels
//! are tokio broadcast senders created on first subscribe and removed when
//! their last subscriber is dropped. Useful for tests and for embedding a
//! pool and its submitters in one process.
//!
//! A [`MemoryBroker`] is one connection to a shared in-process hub; further
//! connections come from [`MemoryBroker::connect`]. Closing a connection ends
//! only its own subscriptions.

use super::{Broker, ERROR_CAPACITY, Subscription};
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

/// Per-channel broadcast buffer.
const CHANNEL_CAPACITY: usize = 1024;

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>;

struct QueueSlot {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: SharedReceiver,
}

struct MemberSet {
    members: BTreeSet<String>,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueSlot>,
    channels: HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>,
    sets: HashMap<String, MemberSet>,
}

/// Connection to an in-process broker hub.
pub struct MemoryBroker {
    hub: Arc<Mutex<State>>,
    closed: watch::Sender<bool>,
    errors: broadcast::Sender<String>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a new hub and return the first connection to it.
    pub fn new() -> Self {
        Self::with_hub(Arc::new(Mutex::new(State::default())))
    }

    /// Open another connection to the same hub.
    pub fn connect(&self) -> Self {
        Self::with_hub(Arc::clone(&self.hub))
    }

    fn with_hub(hub: Arc<Mutex<State>>) -> Self {
        let (closed, _) = watch::channel(false);
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        Self {
            hub,
            closed,
            errors,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another thread panicked mid-update of
        // plain maps; the data is still usable.
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::BrokerClosed)
        } else {
            Ok(())
        }
    }

    /// Number of messages waiting in a queue.
    ///
    /// Reports zero while a consumer is parked on the queue, which only
    /// happens when the queue is empty anyway.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .and_then(|slot| slot.rx.try_lock().ok().map(|rx| rx.len()))
            .unwrap_or(0)
    }

    /// Number of broadcast channels with at least one live subscriber.
    pub fn channel_count(&self) -> usize {
        self.state().channels.len()
    }

    fn queue_slot(
        state: &mut State,
        queue: &str,
    ) -> (mpsc::UnboundedSender<Vec<u8>>, SharedReceiver) {
        let slot = state.queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueSlot {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        (slot.tx.clone(), Arc::clone(&slot.rx))
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // Err means the broker itself was dropped, which also ends the stream.
    let _ = closed.wait_for(|closed| *closed).await;
}

struct QueueSubscription {
    rx: SharedReceiver,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl Subscription for QueueSubscription {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        if *self.closed.borrow() {
            return None;
        }
        let rx = &self.rx;
        tokio::select! {
            _ = wait_closed(&mut self.closed) => None,
            msg = async { rx.lock().await.recv().await } => msg.map(Ok),
        }
    }

    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        // Another consumer parked on the queue holds the lock; nothing is
        // immediately available to us in that case.
        let Ok(mut rx) = self.rx.try_lock() else {
            return Ok(None);
        };
        Ok(rx.try_recv().ok())
    }
}

struct ChannelSubscription {
    channel: String,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
    closed: watch::Receiver<bool>,
    hub: Arc<Mutex<State>>,
}

impl Drop for ChannelSubscription {
    /// The last subscriber to leave removes the channel from the hub.
    fn drop(&mut self) {
        let mut state = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        // Our own receiver is still counted here.
        if state
            .channels
            .get(&self.channel)
            .is_some_and(|tx| tx.receiver_count() <= 1)
        {
            state.channels.remove(&self.channel);
        }
    }
}

impl ChannelSubscription {
    fn lagged(&self, skipped: u64) -> Error {
        Error::Other(format!(
            "subscriber on {} lagged, {skipped} messages dropped",
            self.channel
        ))
    }
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        // Messages published before close are still delivered.
        let received = tokio::select! {
            biased;
            msg = self.rx.recv() => msg,
            _ = wait_closed(&mut self.closed) => return None,
        };
        match received {
            Ok(bytes) => Some(Ok(bytes.as_ref().clone())),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some(Err(self.lagged(skipped))),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(bytes) => Ok(Some(bytes.as_ref().clone())),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => Err(self.lagged(skipped)),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let (tx, _) = Self::queue_slot(&mut self.state(), queue);
        tx.send(payload.to_vec()).map_err(|_| Error::BrokerClosed)?;
        metrics::record_broker_operation(self.kind(), "enqueue");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state();
        let delivered = state
            .channels
            .get(channel)
            .map(|tx| tx.send(Arc::new(payload.to_vec())).is_ok());
        if delivered == Some(false) {
            // Every subscriber is gone.
            state.channels.remove(channel);
            debug!(channel, "published to channel without subscribers");
        }
        metrics::record_broker_operation(self.kind(), "publish");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        let (_, rx) = Self::queue_slot(&mut self.state(), queue);
        Ok(Box::new(QueueSubscription {
            rx,
            closed: self.closed.subscribe(),
        }))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        let rx = self
            .state()
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(Box::new(ChannelSubscription {
            channel: channel.to_string(),
            rx,
            closed: self.closed.subscribe(),
            hub: Arc::clone(&self.hub),
        }))
    }

    async fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state();
        let now = Instant::now();
        let set = state
            .sets
            .entry(key.to_string())
            .or_insert_with(|| MemberSet {
                members: BTreeSet::new(),
                expires_at: now,
            });
        if set.expires_at <= now {
            set.members.clear();
        }
        set.members.insert(member.to_string());
        set.expires_at = now + ttl;
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut state = self.state();
        let now = Instant::now();
        if state.sets.get(key).is_some_and(|set| set.expires_at <= now) {
            state.sets.remove(key);
        }
        Ok(state
            .sets
            .get(key)
            .map(|set| set.members.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("memory broker connection closed");
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
