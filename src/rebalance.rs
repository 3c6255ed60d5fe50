use crate::allocate::AllocateStrategy;
use crate::client::ConsumerShared;
use crate::gateway::QueueChangedCallback;
use crate::offset_store::ReadOffsetType;
use crate::process_queue::ProcessQueue;
use crate::pull::{PullRequest, PullScheduler};
use crate::types::{ConsumeFromWhere, MessageModel, MessageQueue};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Assignment progress of one topic subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    /// No assignment computed yet
    Unassigned,
    /// An assignment pass is in flight
    Assigning,
    /// The held queue set matches the last computed assignment
    Stable,
}

/// Periodically recomputes queue ownership for every subscribed topic and
/// reconciles the live process-queue table against it.
///
/// This engine is the only component that creates or removes process
/// queues; the consume services only mutate their contents.
pub(crate) struct RebalanceEngine {
    shared: Arc<ConsumerShared>,
    strategy: Arc<dyn AllocateStrategy>,
    scheduler: Arc<PullScheduler>,
    queue_changed: Option<QueueChangedCallback>,
    wakeup: Notify,
    topic_states: DashMap<String, RebalanceState>,
}

impl RebalanceEngine {
    pub(crate) fn new(
        shared: Arc<ConsumerShared>,
        strategy: Arc<dyn AllocateStrategy>,
        scheduler: Arc<PullScheduler>,
        queue_changed: Option<QueueChangedCallback>,
    ) -> Self {
        Self {
            shared,
            strategy,
            scheduler,
            queue_changed,
            wakeup: Notify::new(),
            topic_states: DashMap::new(),
        }
    }

    /// Trigger an immediate rebalance pass
    pub(crate) fn wakeup(&self) {
        self.wakeup.notify_one();
    }

    pub(crate) fn state(&self, topic: &str) -> RebalanceState {
        self.topic_states
            .get(topic)
            .map(|entry| *entry.value())
            .unwrap_or(RebalanceState::Unassigned)
    }

    /// Spawn the rebalance loop: periodic timer plus manual wakeup
    pub(crate) fn start(self: Arc<Self>) {
        let this = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.shared.config.rebalance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = this.wakeup.notified() => {}
                }
                this.do_rebalance().await;
            }
            debug!("rebalance loop stopped");
        });
    }

    pub(crate) async fn do_rebalance(&self) {
        self.drop_unsubscribed_queues().await;

        let topics: Vec<String> = self
            .shared
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for topic in topics {
            self.topic_states
                .insert(topic.clone(), RebalanceState::Assigning);
            self.rebalance_by_topic(&topic).await;
            self.topic_states.insert(topic, RebalanceState::Stable);
        }
    }

    /// Queues whose topic lost its subscription are released unconditionally;
    /// their unflushed state is sacrificed (best-effort cleanup).
    async fn drop_unsubscribed_queues(&self) {
        let stale: Vec<(MessageQueue, Arc<ProcessQueue>)> = self
            .shared
            .process_queues
            .iter()
            .filter(|entry| !self.shared.subscriptions.contains_key(&entry.key().topic))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (queue, pq) in stale {
            info!(queue = %queue, "dropping queue for unsubscribed topic");
            pq.set_dropped();
            pq.clear();
            self.shared.offset_store.remove_offset(&queue).await;
            if self.shared.orderly && self.shared.config.message_model == MessageModel::Clustering {
                let _ = self
                    .shared
                    .gateway
                    .unlock_queue(&self.shared.group, &queue)
                    .await;
            }
            self.shared.process_queues.remove(&queue);
        }
    }

    async fn rebalance_by_topic(&self, topic: &str) {
        let queues = match self.shared.topology.fetch_queues(topic).await {
            Ok(queues) => queues,
            Err(err) => {
                warn!(topic, error = %err, "failed to fetch topic queues, keeping assignment");
                return;
            }
        };
        let members = match self
            .shared
            .topology
            .fetch_group_members(&self.shared.group)
            .await
        {
            Ok(members) => members,
            Err(err) => {
                warn!(topic, error = %err, "failed to fetch group members, keeping assignment");
                return;
            }
        };

        // identical ordering on every member is what makes the allocation
        // converge without coordination
        let mut queues = queues;
        queues.sort();
        let mut members = members;
        members.sort();

        let allocated = match self.shared.config.message_model {
            MessageModel::Broadcasting => queues.clone(),
            MessageModel::Clustering => {
                match self
                    .strategy
                    .allocate(&self.shared.client_id, &queues, &members)
                {
                    Ok(allocated) => allocated,
                    Err(err) => {
                        warn!(
                            topic,
                            strategy = self.strategy.name(),
                            error = %err,
                            "allocation failed, assigning nothing"
                        );
                        Vec::new()
                    }
                }
            }
        };

        let changed = self.update_process_queues(topic, &allocated).await;
        if changed {
            info!(
                topic,
                owned = allocated.len(),
                total = queues.len(),
                "queue assignment changed"
            );
            self.notify_queue_changed(topic, &queues, &allocated);
        }
    }

    /// Reconcile the held queue set for one topic against the desired set.
    /// Returns whether anything was added or removed.
    async fn update_process_queues(&self, topic: &str, allocated: &[MessageQueue]) -> bool {
        let mut changed = false;

        // release queues we no longer own
        let held: Vec<(MessageQueue, Arc<ProcessQueue>)> = self
            .shared
            .process_queues
            .iter()
            .filter(|entry| entry.key().topic == topic)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (queue, pq) in &held {
            if !allocated.contains(queue) {
                pq.set_dropped();
                if self.try_release_queue(queue, pq).await {
                    self.shared.process_queues.remove(queue);
                    changed = true;
                    info!(queue = %queue, "released queue");
                } else {
                    // an orderly batch is still in flight; retry next pass
                    debug!(queue = %queue, "queue busy, deferring release");
                }
            }
        }

        // adopt newly assigned queues
        let mut requests = Vec::new();
        for queue in allocated {
            let replace_dropped = self
                .shared
                .process_queues
                .get(queue)
                .map(|entry| entry.value().is_dropped())
                .unwrap_or(true);
            if !replace_dropped {
                continue;
            }
            self.shared.process_queues.remove(queue);

            // a stale entry from a previous owner must not seed the offset
            self.shared.offset_store.remove_offset(queue).await;
            let next_offset = self.compute_pull_offset(queue).await;
            if next_offset < 0 {
                warn!(queue = %queue, "no valid starting offset, skipping queue this pass");
                continue;
            }

            let mut locked = false;
            if self.shared.orderly && self.shared.config.message_model == MessageModel::Clustering {
                match self.shared.gateway.lock_queue(&self.shared.group, queue).await {
                    Ok(true) => locked = true,
                    Ok(false) => {
                        info!(queue = %queue, "broker lock unavailable, skipping queue this pass");
                        continue;
                    }
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "broker lock attempt failed");
                        continue;
                    }
                }
            }

            let pq = Arc::new(ProcessQueue::new());
            if locked {
                pq.set_locked(true);
            }
            self.shared
                .process_queues
                .insert(queue.clone(), pq.clone());
            info!(queue = %queue, next_offset, "adopted queue");
            requests.push(PullRequest {
                consumer_group: self.shared.group.clone(),
                queue: queue.clone(),
                process_queue: pq,
                next_offset,
                previously_locked: locked,
            });
            changed = true;
        }

        for request in requests {
            self.scheduler.enqueue(request);
        }
        changed
    }

    /// Release one queue: persist and forget its offset, give back the
    /// broker lock. Fails (returns false) only when an orderly batch still
    /// holds the consume lock.
    async fn try_release_queue(&self, queue: &MessageQueue, pq: &Arc<ProcessQueue>) -> bool {
        if self.shared.orderly {
            let guard = match tokio::time::timeout(
                Duration::from_millis(500),
                pq.consume_lock().lock(),
            )
            .await
            {
                Ok(guard) => guard,
                Err(_) => return false,
            };
            self.shared.offset_store.persist(queue).await;
            self.shared.offset_store.remove_offset(queue).await;
            if self.shared.config.message_model == MessageModel::Clustering {
                if let Err(err) = self
                    .shared
                    .gateway
                    .unlock_queue(&self.shared.group, queue)
                    .await
                {
                    debug!(queue = %queue, error = %err, "broker unlock failed");
                }
            }
            drop(guard);
        } else {
            self.shared.offset_store.persist(queue).await;
            self.shared.offset_store.remove_offset(queue).await;
        }
        true
    }

    /// Starting offset policy: explicit seek request, then the stored
    /// offset, then the configured broker-policy default.
    async fn compute_pull_offset(&self, queue: &MessageQueue) -> i64 {
        if let Some((_, offset)) = self.shared.seek_requests.remove(queue) {
            info!(queue = %queue, offset, "seeding queue from seek request");
            return offset;
        }

        let stored = self
            .shared
            .offset_store
            .read_offset(queue, ReadOffsetType::ReadFromStore)
            .await;
        if stored >= 0 {
            return stored;
        }

        match self.shared.config.consume_from {
            ConsumeFromWhere::LastOffset => match self.shared.gateway.max_offset(queue).await {
                Ok(offset) => offset,
                Err(err) => {
                    warn!(queue = %queue, error = %err, "max offset query failed");
                    -1
                }
            },
            ConsumeFromWhere::FirstOffset => 0,
            ConsumeFromWhere::Timestamp(ts) => {
                match self.shared.gateway.offset_for_timestamp(queue, ts).await {
                    Ok(offset) => offset,
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "timestamp offset query failed");
                        -1
                    }
                }
            }
        }
    }

    /// Best-effort application notification; a panicking callback must not
    /// abort the rebalance pass.
    fn notify_queue_changed(&self, topic: &str, all: &[MessageQueue], divided: &[MessageQueue]) {
        if let Some(callback) = &self.queue_changed {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(topic, all, divided)
            }));
            if outcome.is_err() {
                warn!(topic, "queue-changed callback panicked");
            }
        }
    }
}
