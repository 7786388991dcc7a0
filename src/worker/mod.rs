//! Workers: pull one item at a time off the work queue, run it, publish the result.

pub mod execute;

pub use execute::{Execution, Executor, Handled, ProcessExecutor, handle_work};

use crate::broker::{Broker, Subscription};
use crate::error::{Error, Result};
use crate::identity;
use crate::protocol::Channels;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_exit, start_work_span};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, warn};

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(250);

/// Resolves once the flag is set or its sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// One executor slot bound to a work queue.
pub struct Worker {
    id: String,
    channels: Channels,
    broker: Arc<dyn Broker>,
    executor: Arc<dyn Executor>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker with a fresh `<host>:<suffix>` identity.
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: &str,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let id = identity::worker_id(&identity::instance_suffix())?;
        Ok(Self::with_id(id, broker, queue, executor))
    }

    pub fn with_id(
        id: impl Into<String>,
        broker: Arc<dyn Broker>,
        queue: &str,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: id.into(),
            channels: Channels::new(queue),
            broker,
            executor,
            shutdown,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start the receive loop and wait until it is polling the queue.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted(format!("worker {}", self.id)));
        }
        let subscription = match self.broker.consume(self.channels.work_queue()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let receive_loop = ReceiveLoop {
            id: self.id.clone(),
            channels: self.channels.clone(),
            broker: Arc::clone(&self.broker),
            executor: Arc::clone(&self.executor),
            shutdown: self.shutdown.subscribe(),
        };
        let handle = tokio::spawn(receive_loop.run(subscription, ready_tx));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        if ready_rx.await.is_err() {
            // The loop ended before parking, e.g. stopped or broker closed.
            debug!(worker = %self.id, "receive loop exited during startup");
        } else {
            debug!(worker = %self.id, "ready");
        }
        Ok(())
    }

    /// Ask the loop to exit. Returns immediately; an item already pulled
    /// still runs to completion and publishes its result.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            debug!(worker = %self.id, "stop requested");
        }
    }

    /// Wait for the receive loop to exit.
    pub async fn join(&self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(worker = %self.id, "receive loop panicked: {e}");
            }
        }
    }
}

struct ReceiveLoop {
    id: String,
    channels: Channels,
    broker: Arc<dyn Broker>,
    executor: Arc<dyn Executor>,
    shutdown: watch::Receiver<bool>,
}

impl ReceiveLoop {
    async fn run(mut self, mut subscription: Box<dyn Subscription>, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        loop {
            // Checked before every pull so nothing new is taken after stop.
            if *self.shutdown.borrow() {
                break;
            }

            let next = match subscription.try_recv().await {
                Ok(Some(payload)) => Some(Ok(payload)),
                Ok(None) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                    tokio::select! {
                        _ = signalled(&mut self.shutdown) => break,
                        next = subscription.recv() => next,
                    }
                }
                Err(e) => Some(Err(e)),
            };

            match next {
                Some(Ok(payload)) => self.process(&payload).await,
                Some(Err(e)) => {
                    warn!(worker = %self.id, "receive failed: {e}");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                    tokio::select! {
                        _ = signalled(&mut self.shutdown) => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
                None => {
                    debug!(worker = %self.id, "work queue subscription closed");
                    break;
                }
            }
        }
        // A claim interrupted by the stop signal is in flight work, not new work.
        match subscription.settle().await {
            Some(Ok(payload)) => self.process(&payload).await,
            Some(Err(e)) => warn!(worker = %self.id, "interrupted receive failed: {e}"),
            None => {}
        }
        drop(subscription);
        debug!(worker = %self.id, "receive loop stopped");
    }

    async fn process(&self, payload: &[u8]) {
        let span = start_work_span(&self.id);
        async {
            debug!(worker = %self.id, "got work");
            metrics::work_received().add(1, &[]);

            let handled = handle_work(&self.id, payload, self.executor.as_ref()).await;
            record_exit(&tracing::Span::current(), handled.result.exit_code);
            metrics::record_result(
                handled.result.exit_code,
                handled.result.error_message.is_some(),
                handled
                    .result
                    .timings
                    .get(crate::protocol::TIMING_EXECUTE)
                    .copied(),
            );
            self.publish(&handled).await;
        }
        .instrument(span)
        .await
    }

    async fn publish(&self, handled: &Handled) {
        if !handled.publish_result() {
            debug!(worker = %self.id, "result publishing disabled for item");
            return;
        }
        let bytes = match handled.result.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(worker = %self.id, "cannot encode result: {e}");
                return;
            }
        };

        let results = self.channels.results();
        if let Err(e) = self.broker.publish(&results, &bytes).await {
            warn!(worker = %self.id, channel = %results, "publish failed: {e}");
        }
        if let Some(id) = handled.correlation() {
            let channel = self.channels.correlation(id);
            match self.broker.publish(&channel, &bytes).await {
                Ok(()) => debug!(worker = %self.id, %channel, "sent result to correlation channel"),
                Err(e) => warn!(worker = %self.id, %channel, "publish failed: {e}"),
            }
        }
    }
}
