//! Work handling, subprocess execution and the worker receive loop.

use async_trait::async_trait;
use runner_rs::broker::{Broker, MemoryBroker, Subscription};
use runner_rs::error::{Error, Result};
use runner_rs::protocol::{
    Channels, TIMING_DECODE, TIMING_EXECUTE, WORKER_ID_ENV, WorkItem, WorkResult,
};
use runner_rs::worker::{Execution, Executor, ProcessExecutor, Worker, handle_work};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

const WAIT: Duration = Duration::from_secs(5);

async fn run(item: WorkItem) -> WorkResult {
    let payload = item.encode().unwrap();
    handle_work("test-host:00000000", &payload, &ProcessExecutor)
        .await
        .result
}

fn sh(script: &str) -> WorkItem {
    WorkItem::new("/bin/sh").arg("-c").arg(script)
}

/// Counts calls and never runs anything.
#[derive(Default)]
struct RecordingExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, item: &WorkItem, _worker_id: &str) -> Execution {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Execution {
            stdout: item.command.clone(),
            ..Execution::default()
        }
    }
}

async fn next_result(sub: &mut Box<dyn Subscription>) -> WorkResult {
    let bytes = tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for result")
        .expect("subscription closed")
        .unwrap();
    WorkResult::decode(&bytes).unwrap()
}

// ---------------------------------------------------------------------------
// handle_work
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_payload_yields_failed_result() {
    let executor = RecordingExecutor::default();
    let handled = handle_work("w", b"{not json", &executor).await;

    assert_eq!(handled.result.exit_code, -1);
    assert!(handled.result.error_message.is_some());
    assert!(handled.item.is_none());
    assert!(handled.publish_result());
    assert_eq!(handled.correlation(), None);
    assert!(handled.result.timings.contains_key(TIMING_DECODE));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_command_is_rejected_without_executing() {
    let executor = RecordingExecutor::default();
    let payload = br#"{"command":"","correlationId":"c1"}"#;
    let handled = handle_work("w", payload, &executor).await;

    assert_eq!(handled.result.exit_code, -1);
    assert_eq!(
        handled.result.error_message.as_deref(),
        Some("must specify command")
    );
    assert_eq!(handled.correlation(), Some("c1"));
    assert!(!handled.result.timings.contains_key(TIMING_EXECUTE));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn correlation_is_dropped_when_publishing_is_off() {
    let executor = RecordingExecutor::default();
    let item = WorkItem::new("x").correlation_id("c2").publish_result(false);
    let handled = handle_work("w", &item.encode().unwrap(), &executor).await;

    assert!(!handled.publish_result());
    assert_eq!(handled.correlation(), None);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn custom_executor_output_lands_in_result() {
    let executor = RecordingExecutor::default();
    let item = WorkItem::new("render");
    let handled = handle_work("w-7", &item.encode().unwrap(), &executor).await;

    assert_eq!(handled.result.source_worker_id, "w-7");
    assert_eq!(handled.result.stdout, "render");
    assert!(handled.result.success());
}

// ---------------------------------------------------------------------------
// ProcessExecutor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_captures_stdout() {
    let result = run(WorkItem::new("/bin/echo").arg("hi")).await;
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.error_message, None);
    assert_eq!(result.source_worker_id, "test-host:00000000");
    assert!(result.timings.contains_key(TIMING_DECODE));
    assert!(result.timings.contains_key(TIMING_EXECUTE));
}

#[tokio::test]
async fn true_exits_zero_with_no_output() {
    let result = run(WorkItem::new("true")).await;
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.is_empty());
}

#[tokio::test]
async fn nonzero_exit_is_reported_not_errored() {
    let result = run(sh("exit 3")).await;
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.error_message, None);
}

#[tokio::test]
async fn stderr_is_captured_separately() {
    let result = run(sh("echo out; echo oops >&2; exit 1")).await;
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "oops\n");
}

#[tokio::test]
async fn item_environment_is_applied() {
    let result = run(sh("echo \"$GREETING\"").env("GREETING", "hello")).await;
    assert_eq!(result.stdout, "hello\n");
}

#[tokio::test]
async fn worker_environment_is_inherited() {
    let result = run(sh("test -n \"$PATH\" && echo ok")).await;
    assert_eq!(result.stdout, "ok\n");
}

#[tokio::test]
async fn worker_id_is_injected_and_not_overridable() {
    let script = format!("echo \"${WORKER_ID_ENV}\"");
    let result = run(sh(&script).env(WORKER_ID_ENV, "spoofed")).await;
    assert_eq!(result.stdout, "test-host:00000000\n");
}

#[tokio::test]
async fn working_dir_is_honored() {
    let dir = std::env::temp_dir().canonicalize().unwrap();
    let result = run(WorkItem::new("pwd").working_dir(dir.to_string_lossy())).await;
    assert_eq!(result.stdout.trim_end(), dir.to_string_lossy());
}

#[tokio::test]
async fn missing_binary_is_a_failed_result() {
    let result = run(WorkItem::new("/definitely/not/a/binary")).await;
    assert_eq!(result.exit_code, -1);
    let error = result.error_message.unwrap();
    assert!(error.contains("failed to run"), "unexpected error: {error}");
}

#[tokio::test]
async fn missing_working_dir_is_a_failed_result() {
    let result = run(WorkItem::new("true").working_dir("/definitely/not/a/dir")).await;
    assert_eq!(result.exit_code, -1);
    assert!(result.error_message.is_some());
}

#[tokio::test]
async fn killed_by_signal_reports_minus_one() {
    let result = run(sh("kill -9 $$")).await;
    assert_eq!(result.exit_code, -1);
    assert_eq!(
        result.error_message.as_deref(),
        Some("terminated by signal 9")
    );
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

fn worker(broker: &Arc<MemoryBroker>, queue: &str) -> Worker {
    Worker::with_id(
        "w1",
        Arc::clone(broker) as Arc<dyn Broker>,
        queue,
        Arc::new(ProcessExecutor),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn publishes_to_results_and_correlation_channel() {
    let broker = Arc::new(MemoryBroker::new());
    let channels = Channels::new("q1");
    let mut all = broker.subscribe(&channels.results()).await.unwrap();
    let mut mine = broker.subscribe(&channels.correlation("job-9")).await.unwrap();

    let worker = worker(&broker, "q1");
    worker.start().await.unwrap();

    let item = WorkItem::new("/bin/echo").arg("hi").correlation_id("job-9");
    broker.enqueue("q1", &item.encode().unwrap()).await.unwrap();

    let broadcast = next_result(&mut all).await;
    let routed = next_result(&mut mine).await;
    assert_eq!(broadcast, routed);
    assert_eq!(routed.stdout, "hi\n");
    assert_eq!(routed.source_worker_id, "w1");

    // Without a correlation id the result goes to the results channel only.
    let plain = WorkItem::new("/bin/echo").arg("plain");
    broker.enqueue("q1", &plain.encode().unwrap()).await.unwrap();
    assert_eq!(next_result(&mut all).await.stdout, "plain\n");

    worker.stop();
    worker.join().await;
    assert!(mine.try_recv().await.unwrap().is_none());
    assert!(all.try_recv().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unpublished_items_produce_no_result() {
    let broker = Arc::new(MemoryBroker::new());
    let mut results = broker.subscribe("q2:results").await.unwrap();

    let worker = worker(&broker, "q2");
    worker.start().await.unwrap();

    let silent = WorkItem::new("/bin/echo").arg("silent").publish_result(false);
    let loud = WorkItem::new("/bin/echo").arg("loud");
    broker.enqueue("q2", &silent.encode().unwrap()).await.unwrap();
    broker.enqueue("q2", &loud.encode().unwrap()).await.unwrap();

    // One worker processes in order, so the first result seen is the second item's.
    assert_eq!(next_result(&mut results).await.stdout, "loud\n");

    worker.stop();
    worker.join().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_message_does_not_stop_the_loop() {
    let broker = Arc::new(MemoryBroker::new());
    let mut results = broker.subscribe("q3:results").await.unwrap();

    let worker = worker(&broker, "q3");
    worker.start().await.unwrap();

    broker.enqueue("q3", b"garbage").await.unwrap();
    let next = WorkItem::new("/bin/echo").arg("after");
    broker.enqueue("q3", &next.encode().unwrap()).await.unwrap();

    let first = next_result(&mut results).await;
    assert_eq!(first.exit_code, -1);
    assert!(first.error_message.is_some());

    let second = next_result(&mut results).await;
    assert_eq!(second.stdout, "after\n");

    worker.stop();
    worker.join().await;
}

#[tokio::test]
async fn starting_twice_is_an_error() {
    let broker = Arc::new(MemoryBroker::new());
    let worker = worker(&broker, "q4");
    worker.start().await.unwrap();

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyStarted(_)));

    worker.stop();
    worker.join().await;
}

#[tokio::test]
async fn stop_ends_an_idle_loop() {
    let broker = Arc::new(MemoryBroker::new());
    let worker = worker(&broker, "q5");
    worker.start().await.unwrap();

    worker.stop();
    worker.stop();
    tokio::time::timeout(WAIT, worker.join())
        .await
        .expect("worker did not exit");
}

#[tokio::test]
async fn closing_the_broker_ends_the_loop() {
    let broker = Arc::new(MemoryBroker::new());
    let worker = worker(&broker, "q6");
    worker.start().await.unwrap();

    broker.close().await;
    tokio::time::timeout(WAIT, worker.join())
        .await
        .expect("worker did not exit");
}

#[tokio::test]
async fn start_on_closed_broker_fails() {
    let broker = Arc::new(MemoryBroker::new());
    broker.close().await;
    let worker = worker(&broker, "q7");
    assert!(matches!(
        worker.start().await.unwrap_err(),
        Error::BrokerClosed
    ));
}

/// Queue subscription that has taken its item off the broker when `recv` is
/// first polled, and only hands it over through `settle`.
struct InterruptedClaim {
    item: Option<Vec<u8>>,
    taken: bool,
    claimed: Arc<Notify>,
}

#[async_trait]
impl Subscription for InterruptedClaim {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.taken = true;
        self.claimed.notify_one();
        std::future::pending().await
    }

    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn settle(&mut self) -> Option<Result<Vec<u8>>> {
        if !self.taken {
            return None;
        }
        self.item.take().map(Ok)
    }
}

/// Memory broker whose queue consumers are [`InterruptedClaim`]s.
struct SlowClaimBroker {
    inner: MemoryBroker,
    item: Vec<u8>,
    claimed: Arc<Notify>,
}

#[async_trait]
impl Broker for SlowClaimBroker {
    fn kind(&self) -> &'static str {
        "slow-claim"
    }

    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.inner.enqueue(queue, payload).await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.inner.publish(channel, payload).await
    }

    async fn consume(&self, _queue: &str) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(InterruptedClaim {
            item: Some(self.item.clone()),
            taken: false,
            claimed: Arc::clone(&self.claimed),
        }))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        self.inner.subscribe(channel).await
    }

    async fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        self.inner.add_member(key, member, ttl).await
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.inner.members(key).await
    }

    fn errors(&self) -> broadcast::Receiver<String> {
        self.inner.errors()
    }

    async fn close(&self) {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_during_a_claim_still_runs_the_claimed_item() {
    let claimed = Arc::new(Notify::new());
    let item = WorkItem::new("/bin/echo").arg("claimed");
    let broker = Arc::new(SlowClaimBroker {
        inner: MemoryBroker::new(),
        item: item.encode().unwrap(),
        claimed: Arc::clone(&claimed),
    });
    let mut results = broker.subscribe("q9:results").await.unwrap();

    let worker = Worker::with_id(
        "w1",
        Arc::clone(&broker) as Arc<dyn Broker>,
        "q9",
        Arc::new(ProcessExecutor),
    );
    worker.start().await.unwrap();
    tokio::time::timeout(WAIT, claimed.notified())
        .await
        .expect("worker never started a claim");

    worker.stop();
    tokio::time::timeout(WAIT, worker.join())
        .await
        .expect("worker did not exit");

    let result = next_result(&mut results).await;
    assert_eq!(result.stdout, "claimed\n");
    assert_eq!(result.source_worker_id, "w1");
}

#[test]
fn generated_ids_carry_the_hostname_prefix() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let worker = Worker::new(broker, "q8", Arc::new(ProcessExecutor)).unwrap();
    let (host, suffix) = worker.id().rsplit_once(':').unwrap();
    assert!(!host.is_empty());
    assert_eq!(suffix.len(), 8);
}
