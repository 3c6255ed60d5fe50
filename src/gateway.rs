//! Boundary traits for the external collaborators of the consumer engine.
//!
//! Wire transport, route discovery and message codecs live behind these
//! traits; the engine only depends on the operations below.

use crate::error::Result;
use crate::message::MessageExt;
use crate::types::{ConsumeResult, MessageQueue, PullResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Topology discovery: authoritative queue and group-membership lists
#[async_trait]
pub trait TopologyService: Send + Sync {
    /// Fetch the full ordered queue list for a topic
    async fn fetch_queues(&self, topic: &str) -> Result<Vec<MessageQueue>>;

    /// Fetch the active consumer IDs of a group
    async fn fetch_group_members(&self, group: &str) -> Result<Vec<String>>;
}

/// Broker-facing operations used by the pull loop, offset store and
/// consume services
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Long-poll pull from a queue starting at `from_offset`
    async fn pull(
        &self,
        queue: &MessageQueue,
        expression: &str,
        from_offset: i64,
        max_count: usize,
        long_poll_timeout: Duration,
    ) -> Result<PullResult>;

    /// Current maximum offset of a queue
    async fn max_offset(&self, queue: &MessageQueue) -> Result<i64>;

    /// Current minimum offset of a queue
    async fn min_offset(&self, queue: &MessageQueue) -> Result<i64>;

    /// Offset of the first message stored at or after `timestamp` (ms)
    async fn offset_for_timestamp(&self, queue: &MessageQueue, timestamp: u64) -> Result<i64>;

    /// Return a message to the broker for delayed redelivery.
    ///
    /// `Ok(false)` means the broker refused; callers treat it like an error.
    async fn send_back(
        &self,
        message: &MessageExt,
        delay_level: i32,
        broker_name_override: Option<&str>,
    ) -> Result<bool>;

    /// Acquire the broker-side lock for orderly consumption of a queue
    async fn lock_queue(&self, group: &str, queue: &MessageQueue) -> Result<bool>;

    /// Release the broker-side lock for a queue
    async fn unlock_queue(&self, group: &str, queue: &MessageQueue) -> Result<()>;

    /// Read the committed offset of a group for a queue; -1 when absent
    async fn query_offset(&self, group: &str, queue: &MessageQueue) -> Result<i64>;

    /// Commit an offset for a group and queue
    async fn update_offset(&self, group: &str, queue: &MessageQueue, offset: i64) -> Result<()>;
}

/// User callback for concurrent consumption
#[async_trait]
pub trait MessageListenerConcurrently: Send + Sync {
    async fn consume(&self, messages: &[MessageExt]) -> ConsumeResult;
}

/// User callback for orderly consumption
#[async_trait]
pub trait MessageListenerOrderly: Send + Sync {
    async fn consume(&self, messages: &[MessageExt]) -> ConsumeResult;
}

/// Consumption mode, fixed at subscription time
#[derive(Clone)]
pub enum MessageListener {
    Concurrently(Arc<dyn MessageListenerConcurrently>),
    Orderly(Arc<dyn MessageListenerOrderly>),
}

impl MessageListener {
    /// Whether this listener requires ordered, lock-guarded delivery
    pub fn is_orderly(&self) -> bool {
        matches!(self, MessageListener::Orderly(_))
    }
}

/// Notification that the queues owned by this instance changed for a topic.
///
/// Arguments: topic, full queue list, queues now owned by this instance.
pub type QueueChangedCallback =
    Arc<dyn Fn(&str, &[MessageQueue], &[MessageQueue]) + Send + Sync>;
