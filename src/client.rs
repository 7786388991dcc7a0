//! Submitting work and controlling pools from outside a pool.

use crate::broker::{Broker, Subscription};
use crate::error::{Error, Result};
use crate::protocol::{Channels, ControlMessage, WorkItem, WorkResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

/// Items a batch keeps submitted and awaiting results at once.
///
/// Each one holds a correlation subscription, which costs a connection on
/// the Postgres broker.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Fresh id for routing one result back to its submitter.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Submitter bound to one queue.
#[derive(Clone)]
pub struct Client {
    broker: Arc<dyn Broker>,
    channels: Channels,
    max_in_flight: usize,
}

impl Client {
    pub fn new(broker: Arc<dyn Broker>, queue: &str) -> Self {
        Self {
            broker,
            channels: Channels::new(queue),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Cap how many batch items are outstanding at once (at least one).
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit.max(1);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn queue(&self) -> &str {
        self.channels.work_queue()
    }

    /// Enqueue an item without waiting for its result.
    pub async fn submit(&self, item: &WorkItem) -> Result<()> {
        let payload = item.encode()?;
        self.broker
            .enqueue(self.channels.work_queue(), &payload)
            .await
    }

    /// Enqueue an item and wait for the single result routed back to us.
    pub async fn submit_and_wait(&self, item: WorkItem) -> Result<WorkResult> {
        let (item, subscription) = self.prepare(item).await?;
        self.submit(&item).await?;
        await_result(subscription).await
    }

    /// Enqueue a batch and collect every result in completion order.
    pub async fn submit_many_and_wait(&self, items: Vec<WorkItem>) -> Result<Vec<WorkResult>> {
        let mut pending = self.submit_many(items).await?;
        let mut results = Vec::with_capacity(pending.len());
        while let Some(result) = pending.next().await {
            results.push(result?);
        }
        Ok(results)
    }

    /// Enqueue a batch and hand back the outstanding results.
    ///
    /// At most [`Client::max_in_flight`] items are submitted up front; the
    /// rest go out as results come back through [`Pending::next`]. Each item's
    /// correlation subscription is opened before that item is enqueued.
    pub async fn submit_many(&self, items: Vec<WorkItem>) -> Result<Pending> {
        let mut pending = Pending {
            client: self.clone(),
            queued: items.into(),
            tasks: JoinSet::new(),
        };
        pending.fill().await?;
        Ok(pending)
    }

    /// Broadcast a stop command to every pool on the queue.
    pub async fn stop_pools(&self) -> Result<()> {
        let payload = ControlMessage::stop().encode()?;
        self.broker.publish(&self.channels.control(), &payload).await
    }

    async fn prepare(&self, mut item: WorkItem) -> Result<(WorkItem, Box<dyn Subscription>)> {
        if item.correlation().is_none() {
            item.correlation_id = Some(new_correlation_id());
        }
        item.publish_result = true;
        let id = item.correlation().unwrap_or_default();
        let channel = self.channels.correlation(id);
        let subscription = self.broker.subscribe(&channel).await?;
        debug!(%channel, "waiting for result");
        Ok((item, subscription))
    }
}

async fn await_result(mut subscription: Box<dyn Subscription>) -> Result<WorkResult> {
    match subscription.recv().await {
        Some(Ok(bytes)) => WorkResult::decode(&bytes),
        Some(Err(e)) => Err(e),
        None => Err(Error::BrokerClosed),
    }
}

/// Results still outstanding from [`Client::submit_many`].
pub struct Pending {
    client: Client,
    queued: VecDeque<WorkItem>,
    tasks: JoinSet<Result<WorkResult>>,
}

impl Pending {
    /// Items not yet returned, submitted or not.
    pub fn len(&self) -> usize {
        self.tasks.len() + self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.queued.is_empty()
    }

    /// Items submitted and awaiting a result.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Submit queued items until the in-flight window is full.
    async fn fill(&mut self) -> Result<()> {
        while self.tasks.len() < self.client.max_in_flight {
            let Some(item) = self.queued.pop_front() else {
                break;
            };
            let (item, subscription) = self.client.prepare(item).await?;
            self.client.submit(&item).await?;
            self.tasks.spawn(await_result(subscription));
        }
        Ok(())
    }

    /// The next result to arrive, or `None` once all have been returned.
    pub async fn next(&mut self) -> Option<Result<WorkResult>> {
        if let Err(e) = self.fill().await {
            return Some(Err(e));
        }
        let joined = self.tasks.join_next().await?;
        Some(joined.unwrap_or_else(|e| Err(Error::Other(format!("result waiter failed: {e}")))))
    }
}
