//! Control plane: the listener loop on `<queue>:control` and command dispatch.

use super::{PoolInner, PoolState};
use crate::broker::Subscription;
use crate::error::Result;
use crate::protocol::{ControlCommand, ControlMessage};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(250);

async fn left_running(state: &mut watch::Receiver<PoolState>) {
    let _ = state.wait_for(|state| *state != PoolState::Running).await;
}

impl PoolInner {
    /// Decode one control message and act on it.
    pub(super) fn apply_control(self: &Arc<Self>, msg: &[u8]) -> Result<ControlCommand> {
        let message = match ControlMessage::decode(msg) {
            Ok(message) => message,
            Err(e) => {
                metrics::control_commands().add(1, &[KeyValue::new("command", "invalid")]);
                return Err(e);
            }
        };
        metrics::control_commands().add(
            1,
            &[KeyValue::new("command", message.command.to_string())],
        );
        match message.command {
            ControlCommand::Stop => {
                info!(queue = %self.channels.work_queue(), "stop command received");
                self.request_stop();
            }
        }
        Ok(message.command)
    }
}

/// Listen for control messages until the pool leaves Running, then tear
/// the pool down.
pub(super) async fn run(
    inner: Arc<PoolInner>,
    mut subscription: Box<dyn Subscription>,
    ready: oneshot::Sender<()>,
) {
    let mut state = inner.state.subscribe();
    let mut errors = inner.broker.errors();
    let mut errors_open = true;
    let mut ready = Some(ready);

    loop {
        if *state.borrow() != PoolState::Running {
            break;
        }

        let next = match subscription.try_recv().await {
            Ok(Some(msg)) => Some(Ok(msg)),
            Ok(None) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
                tokio::select! {
                    _ = left_running(&mut state) => break,
                    err = errors.recv(), if errors_open => {
                        match err {
                            Ok(e) => warn!("broker error: {e}"),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("missed {n} broker errors")
                            }
                            Err(broadcast::error::RecvError::Closed) => errors_open = false,
                        }
                        continue;
                    }
                    next = subscription.recv() => next,
                }
            }
            Err(e) => Some(Err(e)),
        };

        match next {
            Some(Ok(msg)) => {
                if let Err(e) = inner.apply_control(&msg) {
                    warn!("ignoring control message: {e}");
                }
            }
            Some(Err(e)) => {
                warn!("control receive failed: {e}");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
                tokio::select! {
                    _ = left_running(&mut state) => break,
                    _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                }
            }
            None => {
                warn!("control subscription closed, stopping pool");
                inner.begin_stop();
                break;
            }
        }
    }

    match subscription.settle().await {
        Some(Ok(msg)) => {
            if let Err(e) = inner.apply_control(&msg) {
                warn!("ignoring control message: {e}");
            }
        }
        Some(Err(e)) => warn!("interrupted control receive failed: {e}"),
        None => {}
    }
    drop(subscription);
    debug!(queue = %inner.channels.work_queue(), "control loop exited");
    inner.finish().await;
}
