use crate::types::{ConsumeFromWhere, MessageModel};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer instance ID; generated if not set
    pub consumer_id: Option<String>,

    /// Deployment mode: clustering (partitioned) or broadcasting
    pub message_model: MessageModel,

    /// Starting point when a queue has no committed offset
    pub consume_from: ConsumeFromWhere,

    /// Maximum messages fetched per pull
    pub pull_batch_size: usize,

    /// Maximum messages handed to the callback per invocation
    pub consume_batch_size: usize,

    /// Consume worker pool size
    pub consume_thread_max: usize,

    /// Pull loop worker count
    pub pull_worker_count: usize,

    /// Suspend pulling when a queue caches at least this many messages
    pub pull_threshold_for_queue: usize,

    /// Suspend pulling when a queue's cached offset span reaches this value
    pub consume_max_span: i64,

    /// Delay between successful pulls; zero re-enqueues immediately
    pub pull_interval: Duration,

    /// Delay before the next pull when the broker had no new message
    pub pull_idle_delay: Duration,

    /// Delay before retrying a failed pull
    pub pull_exception_delay: Duration,

    /// Delay before re-checking a flow-controlled queue
    pub flow_control_delay: Duration,

    /// Long-poll timeout passed to the broker on each pull
    pub long_poll_timeout: Duration,

    /// Period of the rebalance loop
    pub rebalance_interval: Duration,

    /// Period of the offset persistence loop
    pub persist_interval: Duration,

    /// Period of the orderly queue-lock renewal loop
    pub lock_renew_interval: Duration,

    /// Age after which a broker queue lock is considered expired
    pub lock_max_idle: Duration,

    /// Delay before retrying a failed orderly batch
    pub orderly_retry_delay: Duration,

    /// Delay before locally retrying messages whose send-back failed
    pub consume_retry_delay: Duration,

    /// Orderly mode: attempts before a batch is escalated to the dead-letter path
    pub max_reconsume_times: i32,

    /// Directory for the local offset file; defaults under the home directory
    pub offset_store_dir: Option<PathBuf>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: None,
            message_model: MessageModel::Clustering,
            consume_from: ConsumeFromWhere::LastOffset,
            pull_batch_size: 32,
            consume_batch_size: 1,
            consume_thread_max: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pull_worker_count: 1,
            pull_threshold_for_queue: 1000,
            consume_max_span: 2000,
            pull_interval: Duration::from_millis(0),
            pull_idle_delay: Duration::from_secs(1),
            pull_exception_delay: Duration::from_secs(3),
            flow_control_delay: Duration::from_millis(50),
            long_poll_timeout: Duration::from_secs(15),
            rebalance_interval: Duration::from_secs(20),
            persist_interval: Duration::from_secs(5),
            lock_renew_interval: Duration::from_secs(20),
            lock_max_idle: Duration::from_secs(30),
            orderly_retry_delay: Duration::from_secs(1),
            consume_retry_delay: Duration::from_secs(5),
            max_reconsume_times: 16,
            offset_store_dir: None,
        }
    }
}

impl ConsumerConfig {
    /// Validate the configuration, failing fast on misuse
    pub fn validate(&self) -> Result<(), String> {
        if self.pull_batch_size == 0 {
            return Err("pull_batch_size must be at least 1".to_string());
        }
        if self.consume_batch_size == 0 {
            return Err("consume_batch_size must be at least 1".to_string());
        }
        if self.consume_thread_max == 0 {
            return Err("consume_thread_max must be at least 1".to_string());
        }
        if self.pull_worker_count == 0 {
            return Err("pull_worker_count must be at least 1".to_string());
        }
        if self.pull_threshold_for_queue == 0 {
            return Err("pull_threshold_for_queue must be at least 1".to_string());
        }
        if self.consume_max_span <= 0 {
            return Err("consume_max_span must be positive".to_string());
        }
        if self.max_reconsume_times < 0 {
            return Err("max_reconsume_times must not be negative".to_string());
        }
        Ok(())
    }
}
