mod common;

use common::{fast_config, wait_until, MockGateway, MockTopology, RecordingListener};
use parking_lot::Mutex;
use pullmq_client::{MessageListener, MessageQueue, PushConsumer};
use std::sync::Arc;
use std::time::Duration;

fn queues(count: u32) -> Vec<MessageQueue> {
    (0..count)
        .map(|i| MessageQueue::new("topic-a", "broker-a", i))
        .collect()
}

fn build(
    consumer_id: &str,
    topology: Arc<MockTopology>,
    gateway: Arc<MockGateway>,
) -> PushConsumer {
    PushConsumer::builder()
        .group("group-a")
        .config(fast_config(consumer_id))
        .topology(topology)
        .gateway(gateway)
        .listener(MessageListener::Concurrently(RecordingListener::new()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_assignment_follows_group_membership() {
    let topology = MockTopology::new(queues(4), vec!["c0", "c1"]);
    let gateway = MockGateway::new();

    let consumer = build("c0", topology.clone(), gateway);
    consumer.subscribe("topic-a", "*").unwrap();
    consumer.start().await.unwrap();

    // two members: c0 owns the first half of the sorted queue list
    assert!(
        wait_until(|| consumer.owned_queues().len() == 2, Duration::from_secs(5)).await,
        "expected half the queues, got {:?}",
        consumer.owned_queues()
    );
    let mut owned = consumer.owned_queues();
    owned.sort();
    assert_eq!(owned, queues(4)[..2].to_vec());

    // the other member leaves: everything belongs to c0
    topology.set_members(vec!["c0"]);
    consumer.rebalance_now();
    assert!(
        wait_until(|| consumer.owned_queues().len() == 4, Duration::from_secs(5)).await
    );

    // two more members join: back to a third (rounded up)
    topology.set_members(vec!["c0", "c1", "c2"]);
    consumer.rebalance_now();
    assert!(
        wait_until(|| consumer.owned_queues().len() == 2, Duration::from_secs(5)).await
    );

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_consumer_not_in_group_owns_nothing() {
    // membership list does not contain this instance: allocation fails and
    // the engine must assign nothing rather than crash
    let topology = MockTopology::new(queues(4), vec!["other-1", "other-2"]);
    let gateway = MockGateway::new();

    let consumer = build("c0", topology, gateway);
    consumer.subscribe("topic-a", "*").unwrap();
    consumer.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(consumer.owned_queues().is_empty());

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_drops_queues() {
    let topology = MockTopology::new(queues(2), vec!["c0"]);
    let gateway = MockGateway::new();

    let consumer = build("c0", topology, gateway);
    consumer.subscribe("topic-a", "*").unwrap();
    consumer.start().await.unwrap();
    assert!(
        wait_until(|| consumer.owned_queues().len() == 2, Duration::from_secs(5)).await
    );

    consumer.unsubscribe("topic-a");
    assert!(
        wait_until(|| consumer.owned_queues().is_empty(), Duration::from_secs(5)).await,
        "queues survived unsubscribe"
    );

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_changed_callback_fires() {
    let topology = MockTopology::new(queues(3), vec!["c0"]);
    let gateway = MockGateway::new();
    let observed: Arc<Mutex<Vec<(String, usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let observed_cb = observed.clone();
    let consumer = PushConsumer::builder()
        .group("group-a")
        .config(fast_config("c0"))
        .topology(topology)
        .gateway(gateway)
        .listener(MessageListener::Concurrently(RecordingListener::new()))
        .queue_changed(Arc::new(
            move |topic: &str, all: &[MessageQueue], divided: &[MessageQueue]| {
                observed_cb
                    .lock()
                    .push((topic.to_string(), all.len(), divided.len()));
            },
        ))
        .build()
        .unwrap();

    consumer.subscribe("topic-a", "*").unwrap();
    consumer.start().await.unwrap();

    assert!(
        wait_until(|| !observed.lock().is_empty(), Duration::from_secs(5)).await,
        "queue-changed callback never invoked"
    );
    let first = observed.lock()[0].clone();
    assert_eq!(first, ("topic-a".to_string(), 3, 3));

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panicking_callback_does_not_break_rebalance() {
    let topology = MockTopology::new(queues(2), vec!["c0"]);
    let gateway = MockGateway::new();

    let consumer = PushConsumer::builder()
        .group("group-a")
        .config(fast_config("c0"))
        .topology(topology)
        .gateway(gateway)
        .listener(MessageListener::Concurrently(RecordingListener::new()))
        .queue_changed(Arc::new(
            |_: &str, _: &[MessageQueue], _: &[MessageQueue]| panic!("application bug"),
        ))
        .build()
        .unwrap();

    consumer.subscribe("topic-a", "*").unwrap();
    consumer.start().await.unwrap();

    // the pass still completes and the queues are still assigned
    assert!(
        wait_until(|| consumer.owned_queues().len() == 2, Duration::from_secs(5)).await
    );

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_seek_request_overrides_stored_offset() {
    let topology = MockTopology::new(queues(1), vec!["c0"]);
    let gateway = MockGateway::new();
    gateway.feed(&queues(1)[0], 10);
    let listener = RecordingListener::new();

    let consumer = PushConsumer::builder()
        .group("group-a")
        .config(fast_config("c0"))
        .topology(topology)
        .gateway(gateway)
        .listener(MessageListener::Concurrently(listener.clone()))
        .build()
        .unwrap();

    consumer.subscribe("topic-a", "*").unwrap();
    consumer.seek(queues(1)[0].clone(), 7).unwrap();
    consumer.start().await.unwrap();

    assert!(
        wait_until(|| listener.seen_offsets().len() >= 3, Duration::from_secs(5)).await
    );
    let mut seen = listener.seen_offsets();
    seen.sort();
    assert_eq!(seen, vec![7, 8, 9], "seek request was not honored");

    consumer.shutdown().await.unwrap();
}
