use crate::client::ConsumerShared;
use crate::gateway::{MessageListenerConcurrently, MessageListenerOrderly};
use crate::message::MessageExt;
use crate::process_queue::ProcessQueue;
use crate::types::{ConsumeResult, MessageModel, MessageQueue};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Common surface of the two consumption services. The rebalance and pull
/// layers depend only on this interface, never on the concrete variant.
#[async_trait]
pub(crate) trait ConsumeMessageService: Send + Sync {
    async fn start(&self);
    async fn shutdown(&self);

    /// Schedule consumption of whatever the queue has cached
    fn submit(&self, queue: MessageQueue, process_queue: Arc<ProcessQueue>);
}

async fn invoke_concurrently(
    listener: &Arc<dyn MessageListenerConcurrently>,
    batch: &[MessageExt],
) -> ConsumeResult {
    match AssertUnwindSafe(listener.consume(batch)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!("concurrent listener panicked, treating batch as reconsume-later");
            ConsumeResult::ReconsumeLater
        }
    }
}

async fn invoke_orderly(
    listener: &Arc<dyn MessageListenerOrderly>,
    batch: &[MessageExt],
) -> ConsumeResult {
    match AssertUnwindSafe(listener.consume(batch)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!("orderly listener panicked, treating batch as reconsume-later");
            ConsumeResult::ReconsumeLater
        }
    }
}

/// Concurrent variant: batches from the same queue may be processed in
/// parallel; the committed offset never passes an outstanding message.
#[derive(Clone)]
pub(crate) struct ConsumeMessageConcurrentlyService {
    shared: Arc<ConsumerShared>,
    listener: Arc<dyn MessageListenerConcurrently>,
    permits: Arc<Semaphore>,
}

impl ConsumeMessageConcurrentlyService {
    pub(crate) fn new(
        shared: Arc<ConsumerShared>,
        listener: Arc<dyn MessageListenerConcurrently>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(shared.config.consume_thread_max));
        Self {
            shared,
            listener,
            permits,
        }
    }

    fn resubmit_later(&self, queue: MessageQueue, process_queue: Arc<ProcessQueue>, delay: Duration) {
        let this = self.clone();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !process_queue.is_dropped() {
                        this.submit(queue, process_queue);
                    }
                }
            }
        });
    }

    async fn consume_loop(&self, queue: MessageQueue, pq: Arc<ProcessQueue>) {
        loop {
            if self.shared.shutdown.is_cancelled() || pq.is_dropped() {
                return;
            }
            let batch = pq.take_messages(self.shared.config.consume_batch_size);
            if batch.is_empty() {
                return;
            }

            let result = invoke_concurrently(&self.listener, &batch).await;
            match result {
                ConsumeResult::Success => {
                    let offset = pq.remove_messages(&batch);
                    if offset >= 0 && !pq.is_dropped() {
                        self.shared.offset_store.update_offset(&queue, offset, true);
                    }
                }
                ConsumeResult::ReconsumeLater => {
                    let mut handed_off = Vec::new();
                    let mut send_back_failed = Vec::new();
                    for msg in batch {
                        let delay_level = msg.reconsume_times + 1;
                        match self.shared.gateway.send_back(&msg, delay_level, None).await {
                            Ok(true) => handed_off.push(msg),
                            Ok(false) => {
                                let mut msg = msg;
                                msg.reconsume_times += 1;
                                send_back_failed.push(msg);
                            }
                            Err(err) => {
                                debug!(
                                    queue = %queue,
                                    offset = msg.queue_offset,
                                    error = %err,
                                    "send-back failed, keeping message locally"
                                );
                                let mut msg = msg;
                                msg.reconsume_times += 1;
                                send_back_failed.push(msg);
                            }
                        }
                    }

                    let retry_locally = !send_back_failed.is_empty();
                    if retry_locally {
                        // keep refused messages visible so they are never lost
                        pq.requeue(send_back_failed);
                    }
                    let offset = pq.remove_messages(&handed_off);
                    if offset >= 0 && !pq.is_dropped() {
                        self.shared.offset_store.update_offset(&queue, offset, true);
                    }
                    if retry_locally {
                        self.resubmit_later(queue, pq, self.shared.config.consume_retry_delay);
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ConsumeMessageService for ConsumeMessageConcurrentlyService {
    async fn start(&self) {
        info!(
            workers = self.shared.config.consume_thread_max,
            "concurrent consume service started"
        );
    }

    async fn shutdown(&self) {
        self.permits.close();
        info!("concurrent consume service stopped");
    }

    fn submit(&self, queue: MessageQueue, process_queue: Arc<ProcessQueue>) {
        let this = self.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // pool closed during shutdown
            };
            this.consume_loop(queue, process_queue).await;
        });
    }
}

/// Orderly variant: one batch per queue at a time, in offset order, guarded
/// by the local and (for clustering) broker-granted queue lock.
#[derive(Clone)]
pub(crate) struct ConsumeMessageOrderlyService {
    shared: Arc<ConsumerShared>,
    listener: Arc<dyn MessageListenerOrderly>,
    permits: Arc<Semaphore>,
}

impl ConsumeMessageOrderlyService {
    pub(crate) fn new(
        shared: Arc<ConsumerShared>,
        listener: Arc<dyn MessageListenerOrderly>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(shared.config.consume_thread_max));
        Self {
            shared,
            listener,
            permits,
        }
    }

    fn resubmit_later(&self, queue: MessageQueue, process_queue: Arc<ProcessQueue>, delay: Duration) {
        let this = self.clone();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !process_queue.is_dropped() {
                        this.submit(queue, process_queue);
                    }
                }
            }
        });
    }

    /// Confirm the queue lock, re-acquiring it from the broker when missing
    /// or stale. Broadcasting mode needs no broker lock.
    async fn confirm_lock(&self, queue: &MessageQueue, pq: &ProcessQueue) -> bool {
        if self.shared.config.message_model == MessageModel::Broadcasting {
            return true;
        }
        if pq.is_locked() && !pq.is_lock_expired(self.shared.config.lock_max_idle) {
            return true;
        }
        match self
            .shared
            .gateway
            .lock_queue(&self.shared.group, queue)
            .await
        {
            Ok(true) => {
                pq.set_locked(true);
                true
            }
            Ok(false) => {
                pq.set_locked(false);
                false
            }
            Err(err) => {
                warn!(queue = %queue, error = %err, "queue lock attempt failed");
                false
            }
        }
    }

    async fn consume_orderly(&self, queue: MessageQueue, pq: Arc<ProcessQueue>) {
        // one batch per queue at a time
        let _guard = pq.consume_lock().lock().await;
        loop {
            if self.shared.shutdown.is_cancelled() || pq.is_dropped() {
                return;
            }
            if !self.confirm_lock(&queue, &pq).await {
                debug!(queue = %queue, "queue lock not confirmed, retrying later");
                self.resubmit_later(queue, pq.clone(), self.shared.config.orderly_retry_delay);
                return;
            }

            let batch = pq.take_messages(self.shared.config.consume_batch_size);
            if batch.is_empty() {
                return;
            }

            let result = invoke_orderly(&self.listener, &batch).await;
            match result {
                ConsumeResult::Success => {
                    let offset = pq.commit();
                    if offset >= 0 && !pq.is_dropped() {
                        self.shared.offset_store.update_offset(&queue, offset, false);
                    }
                }
                ConsumeResult::ReconsumeLater => {
                    let exceeded = batch
                        .iter()
                        .any(|m| m.reconsume_times >= self.shared.config.max_reconsume_times);
                    if exceeded {
                        self.escalate_batch(&queue, &pq, batch).await;
                        continue;
                    }
                    // retry the same batch in place, preserving order
                    let batch: Vec<MessageExt> = batch
                        .into_iter()
                        .map(|mut m| {
                            m.reconsume_times += 1;
                            m
                        })
                        .collect();
                    pq.requeue(batch);
                    self.resubmit_later(queue, pq.clone(), self.shared.config.orderly_retry_delay);
                    return;
                }
            }
        }
    }

    /// Dead-letter a batch that exhausted its retries so the queue is not
    /// blocked forever. Messages the broker refuses stay cached locally.
    async fn escalate_batch(
        &self,
        queue: &MessageQueue,
        pq: &Arc<ProcessQueue>,
        batch: Vec<MessageExt>,
    ) {
        warn!(
            queue = %queue,
            count = batch.len(),
            max = self.shared.config.max_reconsume_times,
            "orderly batch exhausted retries, escalating to dead-letter path"
        );
        let mut refused = Vec::new();
        for msg in batch {
            let delay_level = msg.reconsume_times + 1;
            match self.shared.gateway.send_back(&msg, delay_level, None).await {
                Ok(true) => {}
                _ => {
                    let mut msg = msg;
                    msg.reconsume_times += 1;
                    refused.push(msg);
                }
            }
        }
        if !refused.is_empty() {
            pq.requeue(refused);
        }
        let offset = pq.commit();
        if offset >= 0 && !pq.is_dropped() {
            self.shared.offset_store.update_offset(queue, offset, false);
        }
    }

    /// Periodically renew the broker locks of all owned queues
    fn spawn_lock_renewal(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.lock_renew_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let owned: Vec<(MessageQueue, Arc<ProcessQueue>)> = shared
                    .process_queues
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect();
                for (queue, pq) in owned {
                    if pq.is_dropped() {
                        continue;
                    }
                    match shared.gateway.lock_queue(&shared.group, &queue).await {
                        Ok(granted) => pq.set_locked(granted),
                        Err(err) => {
                            // leave the flag alone; it expires on its own
                            debug!(queue = %queue, error = %err, "lock renewal failed");
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ConsumeMessageService for ConsumeMessageOrderlyService {
    async fn start(&self) {
        if self.shared.config.message_model == MessageModel::Clustering {
            self.spawn_lock_renewal();
        }
        info!(
            workers = self.shared.config.consume_thread_max,
            "orderly consume service started"
        );
    }

    async fn shutdown(&self) {
        self.permits.close();
        info!("orderly consume service stopped");
    }

    fn submit(&self, queue: MessageQueue, process_queue: Arc<ProcessQueue>) {
        let this = self.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            this.consume_orderly(queue, process_queue).await;
        });
    }
}
