//! Run a push consumer against a tiny in-memory broker.
//!
//! ```bash
//! cargo run --example simple_push_consumer
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pullmq_client::{
    BrokerGateway, ConsumeFromWhere, ConsumeResult, ConsumerConfig, MessageExt, MessageListener,
    MessageListenerConcurrently, MessageQueue, PushConsumer, PullResult, PullStatus, Result,
    TopologyService,
};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One-process broker stand-in: a message log per queue plus committed offsets
struct InMemoryBroker {
    logs: Mutex<HashMap<MessageQueue, BTreeMap<i64, MessageExt>>>,
    committed: Mutex<HashMap<MessageQueue, i64>>,
}

impl InMemoryBroker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            logs: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
        })
    }

    fn produce(&self, queue: &MessageQueue, body: &str) {
        let mut logs = self.logs.lock();
        let log = logs.entry(queue.clone()).or_default();
        let offset = log.keys().next_back().map(|&o| o + 1).unwrap_or(0);
        let msg = MessageExt::new(queue.clone(), offset, Bytes::from(body.to_string()))
            .with_msg_id(format!("{queue}-{offset}"));
        log.insert(offset, msg);
    }
}

#[async_trait]
impl TopologyService for InMemoryBroker {
    async fn fetch_queues(&self, topic: &str) -> Result<Vec<MessageQueue>> {
        Ok((0..4).map(|i| MessageQueue::new(topic, "demo-broker", i)).collect())
    }

    async fn fetch_group_members(&self, _group: &str) -> Result<Vec<String>> {
        Ok(vec!["demo-consumer".to_string()])
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBroker {
    async fn pull(
        &self,
        queue: &MessageQueue,
        _expression: &str,
        from_offset: i64,
        max_count: usize,
        long_poll_timeout: Duration,
    ) -> Result<PullResult> {
        let (batch, min_offset, max_offset) = {
            let logs = self.logs.lock();
            let log = logs.get(queue).cloned().unwrap_or_default();
            (
                log.range(from_offset..)
                    .take(max_count)
                    .map(|(_, m)| m.clone())
                    .collect::<Vec<_>>(),
                log.keys().next().copied().unwrap_or(0),
                log.keys().next_back().copied().unwrap_or(-1),
            )
        };

        if batch.is_empty() {
            tokio::time::sleep(long_poll_timeout.min(Duration::from_millis(200))).await;
            return Ok(PullResult {
                status: PullStatus::NoNewMessage,
                next_begin_offset: from_offset,
                min_offset,
                max_offset,
                messages: Vec::new(),
            });
        }
        let next_begin_offset = batch.last().map(|m| m.queue_offset + 1).unwrap_or(from_offset);
        Ok(PullResult {
            status: PullStatus::Found,
            next_begin_offset,
            min_offset,
            max_offset,
            messages: batch,
        })
    }

    async fn max_offset(&self, queue: &MessageQueue) -> Result<i64> {
        Ok(self
            .logs
            .lock()
            .get(queue)
            .and_then(|log| log.keys().next_back().map(|&o| o + 1))
            .unwrap_or(0))
    }

    async fn min_offset(&self, queue: &MessageQueue) -> Result<i64> {
        Ok(0)
    }

    async fn offset_for_timestamp(&self, _queue: &MessageQueue, _timestamp: u64) -> Result<i64> {
        Ok(0)
    }

    async fn send_back(
        &self,
        _message: &MessageExt,
        _delay_level: i32,
        _broker_name_override: Option<&str>,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn lock_queue(&self, _group: &str, _queue: &MessageQueue) -> Result<bool> {
        Ok(true)
    }

    async fn unlock_queue(&self, _group: &str, _queue: &MessageQueue) -> Result<()> {
        Ok(())
    }

    async fn query_offset(&self, _group: &str, queue: &MessageQueue) -> Result<i64> {
        Ok(self.committed.lock().get(queue).copied().unwrap_or(-1))
    }

    async fn update_offset(&self, _group: &str, queue: &MessageQueue, offset: i64) -> Result<()> {
        self.committed.lock().insert(queue.clone(), offset);
        Ok(())
    }
}

struct PrintingListener;

#[async_trait]
impl MessageListenerConcurrently for PrintingListener {
    async fn consume(&self, messages: &[MessageExt]) -> ConsumeResult {
        for msg in messages {
            info!(
                queue = %msg.queue,
                offset = msg.queue_offset,
                body = %msg.body_as_string().unwrap_or_default(),
                "consumed"
            );
        }
        ConsumeResult::Success
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let broker = InMemoryBroker::new();
    let config = ConsumerConfig {
        consumer_id: Some("demo-consumer".to_string()),
        consume_from: ConsumeFromWhere::FirstOffset,
        rebalance_interval: Duration::from_secs(1),
        pull_idle_delay: Duration::from_millis(200),
        ..ConsumerConfig::default()
    };

    let consumer = PushConsumer::builder()
        .group("demo-group")
        .config(config)
        .topology(broker.clone())
        .gateway(broker.clone())
        .listener(MessageListener::Concurrently(Arc::new(PrintingListener)))
        .build()?;

    consumer.subscribe("demo-topic", "*")?;
    consumer.start().await?;
    info!(client_id = consumer.client_id(), "consumer running");

    for i in 0..32 {
        let queue = MessageQueue::new("demo-topic", "demo-broker", i % 4);
        broker.produce(&queue, &format!("hello #{i}"));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    consumer.shutdown().await?;
    Ok(())
}
