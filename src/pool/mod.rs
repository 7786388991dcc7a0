//! Pool manager: owns a set of workers on one queue plus the control listener.
//!
//! Lifecycle is `Idle -> Running -> Stopping -> Stopped`. Stopping signals
//! every worker, waits for in-flight items to finish publishing, then closes
//! the broker exactly once.

mod control;

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::identity;
use crate::protocol::{Channels, ControlCommand};
use crate::worker::{Executor, ProcessExecutor, Worker};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// How long a server registration stays visible without a refresh.
pub const SERVERS_TTL: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct PoolInner {
    channels: Channels,
    broker: Arc<dyn Broker>,
    workers: Vec<Worker>,
    state: watch::Sender<PoolState>,
    control_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    /// Signal every worker and move to Stopping. Never blocks.
    ///
    /// Returns true when the pool was never started, in which case nothing
    /// else will run [`PoolInner::finish`].
    fn begin_stop(&self) -> bool {
        for worker in &self.workers {
            worker.stop();
        }
        let mut was_idle = false;
        self.state.send_if_modified(|state| match *state {
            PoolState::Idle => {
                was_idle = true;
                *state = PoolState::Stopping;
                true
            }
            PoolState::Running => {
                *state = PoolState::Stopping;
                true
            }
            PoolState::Stopping | PoolState::Stopped => false,
        });
        was_idle
    }

    /// Begin stopping and, for a never-started pool, finish in the background.
    fn request_stop(self: &Arc<Self>) {
        if !self.begin_stop() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(self);
                let handle = runtime.spawn(async move { inner.finish().await });
                *self.control_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(_) => {
                // No runtime to close the broker on; the caller owns it.
                self.state.send_replace(PoolState::Stopped);
            }
        }
    }

    /// Drain workers, then release the broker.
    async fn finish(&self) {
        for worker in &self.workers {
            worker.stop();
        }
        for worker in &self.workers {
            worker.join().await;
        }
        self.broker.close().await;
        self.state.send_replace(PoolState::Stopped);
        info!(queue = %self.channels.work_queue(), "pool stopped");
    }
}

/// A group of workers serving one queue.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Pool of `worker_count` subprocess workers.
    pub fn new(broker: Arc<dyn Broker>, queue: &str, worker_count: usize) -> Result<Self> {
        Self::with_executor(broker, queue, worker_count, Arc::new(ProcessExecutor))
    }

    /// Pool whose workers run items through `executor`.
    pub fn with_executor(
        broker: Arc<dyn Broker>,
        queue: &str,
        worker_count: usize,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        if queue.is_empty() {
            return Err(Error::Config("queue name must not be empty".into()));
        }
        if worker_count == 0 {
            return Err(Error::Config("pool needs at least one worker".into()));
        }
        let workers = (0..worker_count)
            .map(|_| Worker::new(Arc::clone(&broker), queue, Arc::clone(&executor)))
            .collect::<Result<Vec<_>>>()?;
        let (state, _) = watch::channel(PoolState::Idle);
        Ok(Self {
            inner: Arc::new(PoolInner {
                channels: Channels::new(queue),
                broker,
                workers,
                state,
                control_task: Mutex::new(None),
            }),
        })
    }

    pub fn queue(&self) -> &str {
        self.inner.channels.work_queue()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.inner
            .workers
            .iter()
            .map(|worker| worker.id().to_string())
            .collect()
    }

    pub fn state(&self) -> PoolState {
        *self.inner.state.borrow()
    }

    /// Add this server (`user@host`) to the queue's server set.
    pub async fn register(&self) -> Result<String> {
        let server = identity::server_id()?;
        self.inner
            .broker
            .add_member(&self.inner.channels.servers(), &server, SERVERS_TTL)
            .await?;
        debug!(queue = %self.queue(), %server, "registered server");
        Ok(server)
    }

    /// Servers currently registered for this queue.
    pub async fn members(&self) -> Result<Vec<String>> {
        self.inner.broker.members(&self.inner.channels.servers()).await
    }

    /// Start every worker and the control listener.
    ///
    /// Returns once all of them are waiting for messages.
    pub async fn start(&self) -> Result<()> {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == PoolState::Idle {
                *state = PoolState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(Error::AlreadyStarted(format!("pool for {}", self.queue())));
        }

        for worker in &self.inner.workers {
            if let Err(e) = worker.start().await {
                error!(worker = %worker.id(), "worker failed to start: {e}");
                self.inner.begin_stop();
                self.inner.finish().await;
                return Err(e);
            }
        }

        let subscription = match self
            .inner
            .broker
            .subscribe(&self.inner.channels.control())
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(queue = %self.queue(), "cannot subscribe to control channel: {e}");
                self.inner.begin_stop();
                self.inner.finish().await;
                return Err(e);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(control::run(
            Arc::clone(&self.inner),
            subscription,
            ready_tx,
        ));
        *self
            .inner
            .control_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        let _ = ready_rx.await;

        info!(
            queue = %self.queue(),
            workers = self.inner.workers.len(),
            "pool running"
        );
        Ok(())
    }

    /// Request shutdown. Returns immediately; use [`Pool::wait`] to block
    /// until the pool has drained.
    pub fn stop(&self) {
        self.inner.request_stop();
    }

    /// Block until the pool reaches [`PoolState::Stopped`].
    pub async fn wait(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| *state == PoolState::Stopped).await;
        let handle = self
            .inner
            .control_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(queue = %self.queue(), "control loop panicked: {e}");
            }
        }
    }

    /// Apply a raw control message as if it arrived on the control channel.
    pub fn handle_control(&self, msg: &[u8]) -> Result<ControlCommand> {
        self.inner.apply_control(msg)
    }
}
