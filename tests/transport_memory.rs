// tests/transport_memory.rs

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use mailbus::{
    // ---
    create_memory_transport_with_hub,
    Address,
    Delivery,
    Error,
    MemoryHub,
    QueueSpec,
    TransportPtr,
};

const WAIT: Duration = Duration::from_secs(1);

async fn transport(id: &str, hub: &Arc<MemoryHub>) -> TransportPtr {
    create_memory_transport_with_hub(id, hub.clone())
        .await
        .expect("failed to create memory transport")
}

async fn next(inbox: &mut mpsc::Receiver<Delivery>) -> Delivery {
    timeout(WAIT, inbox.recv())
        .await
        .expect("no delivery in time")
        .expect("inbox closed")
}

#[tokio::test]
async fn messages_published_before_consume_are_kept() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;
    node.declare_queue(&QueueSpec::shared("jobs")).await.unwrap();

    let mut publisher = node.open_publisher().await.unwrap();
    publisher
        .publish(&Address::from("jobs"), Bytes::from_static(b"one"))
        .await
        .unwrap();
    publisher
        .publish(&Address::from("jobs"), Bytes::from_static(b"two"))
        .await
        .unwrap();
    assert_eq!(hub.message_count("jobs"), Some(2));

    let (tx, mut inbox) = mpsc::channel(8);
    node.consume("jobs", 0, tx).await.unwrap();

    let first = next(&mut inbox).await;
    let second = next(&mut inbox).await;
    assert_eq!(first.payload, Bytes::from_static(b"one"));
    assert_eq!(second.payload, Bytes::from_static(b"two"));
    assert!(!first.redelivered);
    assert_eq!(&*first.queue, "jobs");
    assert_eq!(hub.unacked_count(), 2);

    first.ack().await.unwrap();
    second.ack().await.unwrap();
    assert_eq!(hub.unacked_count(), 0);
    assert_eq!(hub.message_count("jobs"), Some(0));
}

#[tokio::test]
async fn publish_to_undeclared_queue_is_dropped() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;

    let mut publisher = node.open_publisher().await.unwrap();
    publisher
        .publish(&Address::from("nowhere"), Bytes::from_static(b"lost"))
        .await
        .expect("publishing to an unknown queue is not an error");

    assert!(!hub.publish_raw("nowhere", "lost"));
    assert!(!hub.queue_exists("nowhere"));
}

#[tokio::test]
async fn consuming_an_undeclared_queue_fails() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;
    let (tx, _inbox) = mpsc::channel(1);

    let err = node.consume("missing", 0, tx).await.unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
}

#[tokio::test]
async fn redeclare_with_other_parameters_is_rejected() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;

    node.declare_queue(&QueueSpec::shared("jobs")).await.unwrap();
    node.declare_queue(&QueueSpec::shared("jobs"))
        .await
        .expect("identical redeclare is a no-op");

    let err = node.declare_queue(&QueueSpec::reply("jobs")).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
}

#[tokio::test]
async fn competing_consumers_each_get_a_share() {
    // ---
    let hub = MemoryHub::new();
    let a = transport("a", &hub).await;
    let b = transport("b", &hub).await;
    a.declare_queue(&QueueSpec::shared("jobs")).await.unwrap();

    let (tx_a, mut inbox_a) = mpsc::channel(16);
    let (tx_b, mut inbox_b) = mpsc::channel(16);
    a.consume("jobs", 0, tx_a).await.unwrap();
    b.consume("jobs", 0, tx_b).await.unwrap();
    assert_eq!(hub.consumer_count("jobs"), Some(2));

    for i in 0..10 {
        assert!(hub.publish_raw("jobs", format!("job-{i}")));
    }

    let mut seen = HashSet::new();
    while seen.len() < 10 {
        let delivery = tokio::select! {
            Some(d) = inbox_a.recv() => d,
            Some(d) = inbox_b.recv() => d,
            _ = tokio::time::sleep(WAIT) => panic!("only {} of 10 delivered", seen.len()),
        };
        assert!(seen.insert(delivery.payload.clone()), "duplicate delivery");
        delivery.ack().await.unwrap();
    }

    assert_eq!(hub.message_count("jobs"), Some(0));
    assert_eq!(hub.unacked_count(), 0);
}

#[tokio::test]
async fn dropped_delivery_is_redelivered() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;
    node.declare_queue(&QueueSpec::shared("jobs")).await.unwrap();

    let (tx, mut inbox) = mpsc::channel(4);
    node.consume("jobs", 0, tx).await.unwrap();
    hub.publish_raw("jobs", "work");

    let first = next(&mut inbox).await;
    assert!(!first.redelivered);
    drop(first);

    let again = next(&mut inbox).await;
    assert!(again.redelivered);
    assert_eq!(again.payload, Bytes::from_static(b"work"));

    again.ack().await.unwrap();
    assert_eq!(hub.unacked_count(), 0);
}

#[tokio::test]
async fn prefetch_bounds_unacked_deliveries() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;
    node.declare_queue(&QueueSpec::shared("jobs")).await.unwrap();

    let (tx, mut inbox) = mpsc::channel(8);
    node.consume("jobs", 1, tx).await.unwrap();
    hub.publish_raw("jobs", "first");
    hub.publish_raw("jobs", "second");

    let first = next(&mut inbox).await;
    let held_back = timeout(Duration::from_millis(50), inbox.recv()).await;
    assert!(held_back.is_err(), "second delivery must wait for the ack");

    first.ack().await.unwrap();
    let second = next(&mut inbox).await;
    assert_eq!(second.payload, Bytes::from_static(b"second"));
}

#[tokio::test]
async fn close_stops_pumps_and_removes_auto_delete_queues() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;
    node.declare_queue(&QueueSpec::shared("jobs")).await.unwrap();
    node.declare_queue(&QueueSpec::reply("jobs.reply.node"))
        .await
        .unwrap();

    let (tx, mut inbox) = mpsc::channel(4);
    node.consume("jobs", 0, tx.clone()).await.unwrap();
    node.consume("jobs.reply.node", 0, tx).await.unwrap();

    node.close().await.unwrap();

    let closed = timeout(WAIT, inbox.recv()).await.expect("pumps still running");
    assert!(closed.is_none());
    assert!(hub.queue_exists("jobs"));
    assert!(!hub.queue_exists("jobs.reply.node"));
}

#[tokio::test]
async fn nack_requeues_or_discards() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;
    node.declare_queue(&QueueSpec::shared("jobs")).await.unwrap();

    let (tx, mut inbox) = mpsc::channel(4);
    node.consume("jobs", 0, tx).await.unwrap();
    hub.publish_raw("jobs", "work");

    let first = next(&mut inbox).await;
    first.nack(true).await.unwrap();

    let again = next(&mut inbox).await;
    assert!(again.redelivered);
    again.nack(false).await.unwrap();

    let nothing = timeout(Duration::from_millis(50), inbox.recv()).await;
    assert!(nothing.is_err(), "discarded delivery came back");
    assert_eq!(hub.unacked_count(), 0);
    assert_eq!(hub.message_count("jobs"), Some(0));
}

#[tokio::test]
async fn injected_publish_failures_are_reported() {
    // ---
    let hub = MemoryHub::new();
    let node = transport("node", &hub).await;
    node.declare_queue(&QueueSpec::shared("jobs")).await.unwrap();
    assert!(hub.fail_next_publishes("jobs", 1));
    assert!(!hub.fail_next_publishes("missing", 1));

    let mut publisher = node.open_publisher().await.unwrap();
    let rejected = publisher
        .publish(&Address::from("jobs"), Bytes::from_static(b"one"))
        .await;
    assert!(matches!(rejected, Err(Error::Transport(_))));
    assert_eq!(hub.message_count("jobs"), Some(0));

    publisher
        .publish(&Address::from("jobs"), Bytes::from_static(b"two"))
        .await
        .expect("only the first publish fails");
    assert_eq!(hub.message_count("jobs"), Some(1));
}
