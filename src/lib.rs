//! PullMQ Client Library
//!
//! Consumer-side coordination engine for a pull-based message queue:
//! distributed queue assignment within a consumer group, per-queue bounded
//! message caches with pull backpressure, concurrent or strictly-ordered
//! delivery to user callbacks, and durable consumption offsets.
//!
//! Wire transport, route discovery and message codecs are external
//! collaborators behind the traits in [`gateway`].

pub mod allocate;
pub mod client;
pub mod config;
pub mod consume;
pub mod error;
pub mod gateway;
pub mod message;
pub mod offset_store;
pub mod process_queue;
pub mod pull;
pub mod rebalance;
pub mod registry;
pub mod types;

pub use allocate::{AllocateAveragely, AllocateStrategy};
pub use client::{ConsumerState, PushConsumer, PushConsumerBuilder};
pub use config::ConsumerConfig;
pub use error::{ClientError, Result};
pub use gateway::{
    BrokerGateway, MessageListener, MessageListenerConcurrently, MessageListenerOrderly,
    QueueChangedCallback, TopologyService,
};
pub use message::MessageExt;
pub use offset_store::{
    LocalFileOffsetStore, OffsetStore, ReadOffsetType, RemoteBrokerOffsetStore,
};
pub use process_queue::ProcessQueue;
pub use pull::{process_pull_result, ProcessedPull, PullRequest};
pub use rebalance::RebalanceState;
pub use registry::ClientRegistry;
pub use types::{
    ConsumeFromWhere, ConsumeResult, ExpressionType, MessageModel, MessageQueue, PullResult,
    PullStatus, Subscription,
};
