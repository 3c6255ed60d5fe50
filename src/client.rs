use crate::allocate::{AllocateAveragely, AllocateStrategy};
use crate::config::ConsumerConfig;
use crate::consume::{
    ConsumeMessageConcurrentlyService, ConsumeMessageOrderlyService, ConsumeMessageService,
};
use crate::error::{ClientError, Result};
use crate::gateway::{BrokerGateway, MessageListener, QueueChangedCallback, TopologyService};
use crate::offset_store::{LocalFileOffsetStore, OffsetStore, RemoteBrokerOffsetStore};
use crate::process_queue::ProcessQueue;
use crate::pull::PullScheduler;
use crate::rebalance::{RebalanceEngine, RebalanceState};
use crate::types::{MessageModel, MessageQueue, Subscription};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Consumer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// State shared by the background loops of one running consumer
pub(crate) struct ConsumerShared {
    pub(crate) group: String,
    pub(crate) client_id: String,
    pub(crate) config: ConsumerConfig,
    pub(crate) topology: Arc<dyn TopologyService>,
    pub(crate) gateway: Arc<dyn BrokerGateway>,
    pub(crate) offset_store: Arc<dyn OffsetStore>,
    pub(crate) subscriptions: Arc<DashMap<String, Subscription>>,
    pub(crate) process_queues: Arc<DashMap<MessageQueue, Arc<ProcessQueue>>>,
    pub(crate) seek_requests: Arc<DashMap<MessageQueue, i64>>,
    pub(crate) suspended: Arc<AtomicBool>,
    /// Whether the registered listener requires ordered delivery
    pub(crate) orderly: bool,
    pub(crate) shutdown: CancellationToken,
}

impl ConsumerShared {
    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn owned_queues(&self) -> Vec<MessageQueue> {
        self.process_queues
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Everything created by `start()` and torn down by `shutdown()`
struct ConsumerRuntime {
    shared: Arc<ConsumerShared>,
    rebalance: Arc<RebalanceEngine>,
    consume: Arc<dyn ConsumeMessageService>,
}

pub(crate) struct ConsumerInner {
    group: String,
    client_id: String,
    config: ConsumerConfig,
    topology: Arc<dyn TopologyService>,
    gateway: Arc<dyn BrokerGateway>,
    strategy: Arc<dyn AllocateStrategy>,
    listener: MessageListener,
    queue_changed: Option<QueueChangedCallback>,
    subscriptions: Arc<DashMap<String, Subscription>>,
    seek_requests: Arc<DashMap<MessageQueue, i64>>,
    suspended: Arc<AtomicBool>,
    state: Mutex<ConsumerState>,
    runtime: Mutex<Option<ConsumerRuntime>>,
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        // the handle is gone; stop the background loops it spawned
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shared.shutdown.cancel();
        }
    }
}

/// Pull-based push-style consumer: owns the rebalance, pull and consume
/// loops and invokes the registered listener as messages arrive.
#[derive(Clone)]
pub struct PushConsumer {
    pub(crate) inner: Arc<ConsumerInner>,
}

/// Builder for creating consumers
pub struct PushConsumerBuilder {
    group: Option<String>,
    config: ConsumerConfig,
    topology: Option<Arc<dyn TopologyService>>,
    gateway: Option<Arc<dyn BrokerGateway>>,
    strategy: Arc<dyn AllocateStrategy>,
    listener: Option<MessageListener>,
    queue_changed: Option<QueueChangedCallback>,
}

impl PushConsumerBuilder {
    pub fn new() -> Self {
        Self {
            group: None,
            config: ConsumerConfig::default(),
            topology: None,
            gateway: None,
            strategy: Arc::new(AllocateAveragely),
            listener: None,
            queue_changed: None,
        }
    }

    /// Set the consumer group (required)
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the consumer configuration
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the topology discovery collaborator (required)
    pub fn topology(mut self, topology: Arc<dyn TopologyService>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Set the broker gateway collaborator (required)
    pub fn gateway(mut self, gateway: Arc<dyn BrokerGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Override the queue allocation strategy
    pub fn allocate_strategy(mut self, strategy: Arc<dyn AllocateStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Register the message listener (required); its variant selects
    /// concurrent or orderly delivery
    pub fn listener(mut self, listener: MessageListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Register the optional queue-assignment-changed callback
    pub fn queue_changed(mut self, callback: QueueChangedCallback) -> Self {
        self.queue_changed = Some(callback);
        self
    }

    /// Build the consumer
    pub fn build(self) -> Result<PushConsumer> {
        let group = self
            .group
            .filter(|g| !g.is_empty())
            .ok_or_else(|| ClientError::InvalidConfig("consumer group is required".to_string()))?;
        let topology = self.topology.ok_or_else(|| {
            ClientError::InvalidConfig("topology service is required".to_string())
        })?;
        let gateway = self
            .gateway
            .ok_or_else(|| ClientError::InvalidConfig("broker gateway is required".to_string()))?;
        let listener = self
            .listener
            .ok_or_else(|| ClientError::InvalidConfig("message listener is required".to_string()))?;
        self.config
            .validate()
            .map_err(ClientError::InvalidConfig)?;

        let client_id = self
            .config
            .consumer_id
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));

        Ok(PushConsumer {
            inner: Arc::new(ConsumerInner {
                group,
                client_id,
                config: self.config,
                topology,
                gateway,
                strategy: self.strategy,
                listener,
                queue_changed: self.queue_changed,
                subscriptions: Arc::new(DashMap::new()),
                seek_requests: Arc::new(DashMap::new()),
                suspended: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(ConsumerState::Stopped),
                runtime: Mutex::new(None),
            }),
        })
    }
}

impl Default for PushConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PushConsumer {
    /// Create a new consumer builder
    pub fn builder() -> PushConsumerBuilder {
        PushConsumerBuilder::new()
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.lock()
    }

    /// Subscribe to a topic with a tag expression; `""` and `"*"` match
    /// everything. Allowed while stopped or started, not during a state
    /// transition.
    pub fn subscribe(&self, topic: &str, expression: &str) -> Result<()> {
        self.subscribe_with(Subscription::tags(topic, expression))
    }

    /// Subscribe with an explicit subscription (tag or SQL92 filter)
    pub fn subscribe_with(&self, subscription: Subscription) -> Result<()> {
        if subscription.topic.is_empty() {
            return Err(ClientError::InvalidArgument(
                "topic must be a non-empty string".to_string(),
            ));
        }
        match self.state() {
            ConsumerState::Starting => {
                return Err(ClientError::IllegalState(
                    "cannot subscribe while consumer is starting".to_string(),
                ))
            }
            ConsumerState::Stopping => {
                return Err(ClientError::IllegalState(
                    "cannot subscribe while consumer is stopping".to_string(),
                ))
            }
            _ => {}
        }
        self.inner
            .subscriptions
            .insert(subscription.topic.clone(), subscription);
        self.rebalance_now();
        Ok(())
    }

    /// Drop a topic subscription; its queues are released on the next
    /// rebalance pass
    pub fn unsubscribe(&self, topic: &str) {
        self.inner.subscriptions.remove(topic);
        self.rebalance_now();
    }

    /// Request that a queue start from an explicit offset at its next
    /// assignment, overriding the stored offset
    pub fn seek(&self, queue: MessageQueue, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(ClientError::InvalidArgument(
                "seek offset must not be negative".to_string(),
            ));
        }
        self.inner.seek_requests.insert(queue, offset);
        self.rebalance_now();
        Ok(())
    }

    /// Pause pulling; cached messages keep flowing to the listener
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::Release);
        info!(client_id = %self.inner.client_id, "consumer suspended");
    }

    /// Resume pulling after a suspend
    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::Release);
        info!(client_id = %self.inner.client_id, "consumer resumed");
    }

    /// Queues currently owned by this instance
    pub fn owned_queues(&self) -> Vec<MessageQueue> {
        let runtime = self.inner.runtime.lock();
        runtime
            .as_ref()
            .map(|r| r.shared.owned_queues())
            .unwrap_or_default()
    }

    /// Assignment progress of one topic
    pub fn rebalance_state(&self, topic: &str) -> RebalanceState {
        let runtime = self.inner.runtime.lock();
        runtime
            .as_ref()
            .map(|r| r.rebalance.state(topic))
            .unwrap_or(RebalanceState::Unassigned)
    }

    /// Trigger an immediate rebalance pass
    pub fn rebalance_now(&self) {
        let runtime = self.inner.runtime.lock();
        if let Some(runtime) = runtime.as_ref() {
            runtime.rebalance.wakeup();
        }
    }

    /// Start the consumer: load offsets and spawn the background loops
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConsumerState::Stopped => *state = ConsumerState::Starting,
                ConsumerState::Starting => {
                    return Err(ClientError::IllegalState(
                        "consumer is already starting".to_string(),
                    ))
                }
                ConsumerState::Started => {
                    return Err(ClientError::IllegalState(
                        "consumer is already started".to_string(),
                    ))
                }
                ConsumerState::Stopping => {
                    return Err(ClientError::IllegalState(
                        "consumer is stopping, wait for shutdown to complete".to_string(),
                    ))
                }
            }
        }

        match self.start_runtime().await {
            Ok(()) => {
                *self.inner.state.lock() = ConsumerState::Started;
                info!(
                    client_id = %self.inner.client_id,
                    group = %self.inner.group,
                    "consumer started"
                );
                Ok(())
            }
            Err(err) => {
                *self.inner.state.lock() = ConsumerState::Stopped;
                Err(err)
            }
        }
    }

    async fn start_runtime(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.subscriptions.is_empty() {
            return Err(ClientError::InvalidConfig(
                "at least one subscription is required before start".to_string(),
            ));
        }

        let offset_store: Arc<dyn OffsetStore> = match inner.config.message_model {
            MessageModel::Broadcasting => match &inner.config.offset_store_dir {
                Some(dir) => Arc::new(LocalFileOffsetStore::with_dir(&inner.group, dir.clone())),
                None => Arc::new(LocalFileOffsetStore::new(&inner.client_id, &inner.group)),
            },
            MessageModel::Clustering => Arc::new(RemoteBrokerOffsetStore::new(
                &inner.group,
                inner.gateway.clone(),
            )),
        };
        offset_store.load().await?;

        let shared = Arc::new(ConsumerShared {
            group: inner.group.clone(),
            client_id: inner.client_id.clone(),
            config: inner.config.clone(),
            topology: inner.topology.clone(),
            gateway: inner.gateway.clone(),
            offset_store,
            subscriptions: inner.subscriptions.clone(),
            process_queues: Arc::new(DashMap::new()),
            seek_requests: inner.seek_requests.clone(),
            suspended: inner.suspended.clone(),
            orderly: inner.listener.is_orderly(),
            shutdown: CancellationToken::new(),
        });

        let consume: Arc<dyn ConsumeMessageService> = match &inner.listener {
            MessageListener::Concurrently(listener) => Arc::new(
                ConsumeMessageConcurrentlyService::new(shared.clone(), listener.clone()),
            ),
            MessageListener::Orderly(listener) => Arc::new(ConsumeMessageOrderlyService::new(
                shared.clone(),
                listener.clone(),
            )),
        };
        consume.start().await;

        let scheduler = Arc::new(PullScheduler::new(shared.clone(), consume.clone()));
        scheduler.start();

        let rebalance = Arc::new(RebalanceEngine::new(
            shared.clone(),
            inner.strategy.clone(),
            scheduler,
            inner.queue_changed.clone(),
        ));
        rebalance.clone().start();

        spawn_persist_loop(shared.clone());

        *inner.runtime.lock() = Some(ConsumerRuntime {
            shared,
            rebalance,
            consume,
        });
        Ok(())
    }

    /// Shut the consumer down: stop the loops, persist offsets and release
    /// owned queues
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConsumerState::Started => *state = ConsumerState::Stopping,
                ConsumerState::Stopped => {
                    return Err(ClientError::IllegalState(
                        "consumer is already stopped".to_string(),
                    ))
                }
                ConsumerState::Stopping => {
                    return Err(ClientError::IllegalState(
                        "consumer is already stopping".to_string(),
                    ))
                }
                ConsumerState::Starting => {
                    return Err(ClientError::IllegalState(
                        "consumer is starting, wait for start to complete".to_string(),
                    ))
                }
            }
        }

        let runtime = self.inner.runtime.lock().take();
        if let Some(runtime) = runtime {
            let shared = &runtime.shared;
            shared.shutdown.cancel();

            let owned = shared.owned_queues();
            shared.offset_store.persist_all(&owned).await;

            for queue in &owned {
                if let Some((_, pq)) = shared.process_queues.remove(queue) {
                    pq.set_dropped();
                    pq.clear();
                }
                if shared.orderly && shared.config.message_model == MessageModel::Clustering {
                    if let Err(err) = shared.gateway.unlock_queue(&shared.group, queue).await {
                        warn!(queue = %queue, error = %err, "unlock on shutdown failed");
                    }
                }
            }

            runtime.consume.shutdown().await;
        }

        *self.inner.state.lock() = ConsumerState::Stopped;
        info!(client_id = %self.inner.client_id, "consumer stopped");
        Ok(())
    }
}

/// Periodically persist the offsets of all owned queues
fn spawn_persist_loop(shared: Arc<ConsumerShared>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.persist_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let owned = shared.owned_queues();
            if !owned.is_empty() {
                shared.offset_store.persist_all(&owned).await;
            }
        }
    });
}
