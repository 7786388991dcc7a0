//! Submitting work through the client against a running in-memory pool.

use runner_rs::broker::{Broker, MemoryBroker};
use runner_rs::client::{Client, DEFAULT_MAX_IN_FLIGHT, new_correlation_id};
use runner_rs::error::Error;
use runner_rs::pool::Pool;
use runner_rs::protocol::{ControlMessage, WorkItem, WorkResult};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn running_pool(hub: &MemoryBroker, queue: &str, workers: usize) -> Pool {
    let pool = Pool::new(Arc::new(hub.connect()), queue, workers).unwrap();
    pool.start().await.unwrap();
    pool
}

async fn shutdown(pool: Pool) {
    pool.stop();
    tokio::time::timeout(WAIT, pool.wait()).await.unwrap();
}

#[test]
fn correlation_ids_are_short_and_unique() {
    let a = new_correlation_id();
    let b = new_correlation_id();
    assert_eq!(a.len(), 12);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_and_wait_returns_the_result() {
    let hub = MemoryBroker::new();
    let pool = running_pool(&hub, "cw", 1).await;
    let client = Client::new(Arc::new(hub.connect()), "cw");

    let result = tokio::time::timeout(
        WAIT,
        client.submit_and_wait(WorkItem::new("/bin/echo").arg("hi")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hi\n");

    shutdown(pool).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_and_wait_forces_publishing() {
    let hub = MemoryBroker::new();
    let pool = running_pool(&hub, "cf", 1).await;
    let client = Client::new(Arc::new(hub.connect()), "cf");

    let item = WorkItem::new("/bin/echo")
        .arg("forced")
        .correlation_id("explicit-id")
        .publish_result(false);
    let result = tokio::time::timeout(WAIT, client.submit_and_wait(item))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.stdout, "forced\n");

    shutdown(pool).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_failures_still_reach_the_submitter() {
    let hub = MemoryBroker::new();
    let pool = running_pool(&hub, "cv", 1).await;
    let client = Client::new(Arc::new(hub.connect()), "cv");

    let result = tokio::time::timeout(WAIT, client.submit_and_wait(WorkItem::new("")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.exit_code, -1);
    assert_eq!(result.error_message.as_deref(), Some("must specify command"));

    shutdown(pool).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_results_come_back_for_every_item() {
    let hub = MemoryBroker::new();
    let pool = running_pool(&hub, "cb", 3).await;
    let client = Client::new(Arc::new(hub.connect()), "cb");

    let items = (0..6)
        .map(|n| WorkItem::new("/bin/echo").arg(n.to_string()))
        .collect();
    let results = tokio::time::timeout(WAIT, client.submit_many_and_wait(items))
        .await
        .unwrap()
        .unwrap();

    let mut outputs: Vec<_> = results.iter().map(|r| r.stdout.trim().to_string()).collect();
    outputs.sort();
    assert_eq!(outputs, vec!["0", "1", "2", "3", "4", "5"]);

    shutdown(pool).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_waits_leave_no_correlation_channels_behind() {
    let hub = MemoryBroker::new();
    let pool = running_pool(&hub, "cl", 2).await;
    let client = Client::new(Arc::new(hub.connect()), "cl");

    for n in 0..20 {
        let item = WorkItem::new("/bin/echo").arg(n.to_string());
        let result = tokio::time::timeout(WAIT, client.submit_and_wait(item))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.stdout, format!("{n}\n"));
    }
    // Only the pool's control channel is still subscribed.
    assert_eq!(hub.channel_count(), 1);

    shutdown(pool).await;
    assert_eq!(hub.channel_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn batches_keep_a_bounded_window_in_flight() {
    let hub = MemoryBroker::new();
    let client = Client::new(Arc::new(hub.connect()), "cwin").with_max_in_flight(2);
    assert_eq!(client.max_in_flight(), 2);

    let items = (0..6)
        .map(|n| WorkItem::new("/bin/echo").arg(n.to_string()))
        .collect();
    let mut pending = client.submit_many(items).await.unwrap();
    assert_eq!(pending.len(), 6);
    assert_eq!(pending.in_flight(), 2);
    assert_eq!(hub.queue_len("cwin"), 2);
    assert_eq!(hub.channel_count(), 2);

    let pool = running_pool(&hub, "cwin", 3).await;
    let mut outputs = Vec::new();
    while let Some(result) = tokio::time::timeout(WAIT, pending.next()).await.unwrap() {
        assert!(pending.in_flight() <= 2);
        // Correlation channels for the window, plus the pool's control channel.
        assert!(hub.channel_count() <= 3);
        outputs.push(result.unwrap().stdout.trim().to_string());
    }
    outputs.sort();
    assert_eq!(outputs, vec!["0", "1", "2", "3", "4", "5"]);
    assert!(pending.is_empty());

    shutdown(pool).await;
}

#[test]
fn in_flight_window_is_at_least_one() {
    let hub = MemoryBroker::new();
    let client = Client::new(Arc::new(hub.connect()), "c0");
    assert_eq!(client.max_in_flight(), DEFAULT_MAX_IN_FLIGHT);
    assert_eq!(client.with_max_in_flight(0).max_in_flight(), 1);
}

#[tokio::test]
async fn plain_submit_lands_on_the_queue() {
    let hub = MemoryBroker::new();
    let client = Client::new(Arc::new(hub.connect()), "cq");
    client.submit(&WorkItem::new("true")).await.unwrap();
    client.submit(&WorkItem::new("true")).await.unwrap();
    assert_eq!(hub.queue_len("cq"), 2);
}

#[tokio::test]
async fn stop_pools_publishes_on_the_control_channel() {
    let hub = MemoryBroker::new();
    let mut control = hub.subscribe("cs:control").await.unwrap();
    let client = Client::new(Arc::new(hub.connect()), "cs");

    client.stop_pools().await.unwrap();
    let bytes = control.recv().await.unwrap().unwrap();
    assert_eq!(ControlMessage::decode(&bytes).unwrap(), ControlMessage::stop());
}

#[tokio::test]
async fn waiting_on_a_closed_broker_fails() {
    let hub = MemoryBroker::new();
    let broker = Arc::new(hub.connect());
    let client = Client::new(Arc::clone(&broker) as Arc<dyn Broker>, "cc");

    let waiter = tokio::spawn(async move { client.submit_and_wait(WorkItem::new("true")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.close().await;

    let err = tokio::time::timeout(WAIT, waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::BrokerClosed));
}

#[tokio::test]
async fn pending_yields_nothing_for_an_empty_batch() {
    let hub = MemoryBroker::new();
    let client = Client::new(Arc::new(hub.connect()), "ce");
    let mut pending = client.submit_many(Vec::new()).await.unwrap();
    assert!(pending.is_empty());
    assert!(pending.next().await.is_none());
    let results: Vec<WorkResult> = client.submit_many_and_wait(Vec::new()).await.unwrap();
    assert!(results.is_empty());
}
