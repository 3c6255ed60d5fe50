//! In-memory collaborators for driving the consumer engine in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pullmq_client::{
    BrokerGateway, ClientError, ConsumeFromWhere, ConsumeResult, ConsumerConfig, MessageExt,
    MessageListenerConcurrently, MessageListenerOrderly, MessageQueue, PullResult, PullStatus,
    Result, TopologyService,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Topology with adjustable queue and membership lists
pub struct MockTopology {
    queues: Mutex<Vec<MessageQueue>>,
    members: Mutex<Vec<String>>,
}

impl MockTopology {
    pub fn new(queues: Vec<MessageQueue>, members: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(queues),
            members: Mutex::new(members.into_iter().map(String::from).collect()),
        })
    }

    pub fn set_members(&self, members: Vec<&str>) {
        *self.members.lock() = members.into_iter().map(String::from).collect();
    }

    pub fn set_queues(&self, queues: Vec<MessageQueue>) {
        *self.queues.lock() = queues;
    }
}

#[async_trait]
impl TopologyService for MockTopology {
    async fn fetch_queues(&self, topic: &str) -> Result<Vec<MessageQueue>> {
        Ok(self
            .queues
            .lock()
            .iter()
            .filter(|mq| mq.topic == topic)
            .cloned()
            .collect())
    }

    async fn fetch_group_members(&self, _group: &str) -> Result<Vec<String>> {
        Ok(self.members.lock().clone())
    }
}

/// In-memory broker: seeded message logs, recorded commits and send-backs
pub struct MockGateway {
    messages: Mutex<HashMap<MessageQueue, BTreeMap<i64, MessageExt>>>,
    committed: Mutex<HashMap<MessageQueue, i64>>,
    sent_back: Mutex<Vec<MessageExt>>,
    pub send_back_ok: AtomicBool,
    pub lock_grants: AtomicBool,
    pub fail_pulls: AtomicI32,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            sent_back: Mutex::new(Vec::new()),
            send_back_ok: AtomicBool::new(true),
            lock_grants: AtomicBool::new(true),
            fail_pulls: AtomicI32::new(0),
        })
    }

    /// Append `count` messages to a queue starting at its current tail
    pub fn feed(&self, queue: &MessageQueue, count: usize) {
        let mut messages = self.messages.lock();
        let log = messages.entry(queue.clone()).or_default();
        let mut offset = log.keys().next_back().map(|&o| o + 1).unwrap_or(0);
        for _ in 0..count {
            let msg = MessageExt::new(queue.clone(), offset, Bytes::from(format!("m-{offset}")))
                .with_msg_id(format!("{queue}-{offset}"))
                .with_tags("tagA");
            log.insert(offset, msg);
            offset += 1;
        }
    }

    pub fn committed_offset(&self, queue: &MessageQueue) -> i64 {
        self.committed.lock().get(queue).copied().unwrap_or(-1)
    }

    pub fn sent_back_offsets(&self) -> Vec<i64> {
        self.sent_back.lock().iter().map(|m| m.queue_offset).collect()
    }
}

#[async_trait]
impl BrokerGateway for MockGateway {
    async fn pull(
        &self,
        queue: &MessageQueue,
        _expression: &str,
        from_offset: i64,
        max_count: usize,
        _long_poll_timeout: Duration,
    ) -> Result<PullResult> {
        if self.fail_pulls.fetch_sub(1, Ordering::AcqRel) > 0 {
            return Err(ClientError::Connection("injected pull failure".to_string()));
        }
        self.fail_pulls.fetch_max(0, Ordering::AcqRel);

        let batch;
        let min_offset;
        let max_offset;
        {
            let messages = self.messages.lock();
            let log = messages.get(queue).cloned().unwrap_or_default();
            min_offset = log.keys().next().copied().unwrap_or(0);
            max_offset = log.keys().next_back().copied().unwrap_or(-1);
            batch = log
                .range(from_offset..)
                .take(max_count)
                .map(|(_, m)| m.clone())
                .collect::<Vec<_>>();
        }

        if batch.is_empty() {
            // keep the test loop from spinning too hot on an empty queue
            tokio::time::sleep(Duration::from_millis(5)).await;
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
            .messages
            .lock()
            .get(queue)
            .and_then(|log| log.keys().next_back().map(|&o| o + 1))
            .unwrap_or(0))
    }

    async fn min_offset(&self, queue: &MessageQueue) -> Result<i64> {
        Ok(self
            .messages
            .lock()
            .get(queue)
            .and_then(|log| log.keys().next().copied())
            .unwrap_or(0))
    }

    async fn offset_for_timestamp(&self, _queue: &MessageQueue, _timestamp: u64) -> Result<i64> {
        Ok(0)
    }

    async fn send_back(
        &self,
        message: &MessageExt,
        _delay_level: i32,
        _broker_name_override: Option<&str>,
    ) -> Result<bool> {
        if self.send_back_ok.load(Ordering::Acquire) {
            self.sent_back.lock().push(message.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn lock_queue(&self, _group: &str, _queue: &MessageQueue) -> Result<bool> {
        Ok(self.lock_grants.load(Ordering::Acquire))
    }

    async fn unlock_queue(&self, _group: &str, _queue: &MessageQueue) -> Result<()> {
        Ok(())
    }

    async fn query_offset(&self, _group: &str, queue: &MessageQueue) -> Result<i64> {
        Ok(self.committed_offset(queue))
    }

    async fn update_offset(&self, _group: &str, queue: &MessageQueue, offset: i64) -> Result<()> {
        self.committed.lock().insert(queue.clone(), offset);
        Ok(())
    }
}

/// Listener that records every delivered offset and can fail the first N
/// invocations
pub struct RecordingListener {
    pub seen: Mutex<Vec<(MessageQueue, i64)>>,
    pub fail_invocations: AtomicI32,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(times: i32) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail_invocations: AtomicI32::new(times),
        })
    }

    pub fn seen_offsets(&self) -> Vec<i64> {
        self.seen.lock().iter().map(|(_, o)| *o).collect()
    }

    fn record(&self, messages: &[MessageExt]) -> ConsumeResult {
        let mut seen = self.seen.lock();
        for msg in messages {
            seen.push((msg.queue.clone(), msg.queue_offset));
        }
        drop(seen);
        if self.fail_invocations.fetch_sub(1, Ordering::AcqRel) > 0 {
            ConsumeResult::ReconsumeLater
        } else {
            ConsumeResult::Success
        }
    }
}

#[async_trait]
impl MessageListenerConcurrently for RecordingListener {
    async fn consume(&self, messages: &[MessageExt]) -> ConsumeResult {
        self.record(messages)
    }
}

#[async_trait]
impl MessageListenerOrderly for RecordingListener {
    async fn consume(&self, messages: &[MessageExt]) -> ConsumeResult {
        self.record(messages)
    }
}

/// Configuration with intervals shrunk for test turnaround
pub fn fast_config(consumer_id: &str) -> ConsumerConfig {
    ConsumerConfig {
        consumer_id: Some(consumer_id.to_string()),
        consume_from: ConsumeFromWhere::FirstOffset,
        rebalance_interval: Duration::from_millis(50),
        persist_interval: Duration::from_millis(40),
        pull_idle_delay: Duration::from_millis(20),
        pull_exception_delay: Duration::from_millis(30),
        flow_control_delay: Duration::from_millis(10),
        consume_retry_delay: Duration::from_millis(40),
        orderly_retry_delay: Duration::from_millis(30),
        lock_renew_interval: Duration::from_millis(50),
        long_poll_timeout: Duration::from_millis(100),
        ..ConsumerConfig::default()
    }
}

/// Poll a condition until it holds or the timeout elapses
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
