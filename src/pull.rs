use crate::client::ConsumerShared;
use crate::consume::ConsumeMessageService;
use crate::message::MessageExt;
use crate::process_queue::ProcessQueue;
use crate::error::ClientError;
use crate::types::{MessageModel, MessageQueue, PullResult, PullStatus, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A pending pull for one queue. Created by the rebalance engine and
/// recycled by the scheduler until the queue is dropped.
pub struct PullRequest {
    pub consumer_group: String,
    pub queue: MessageQueue,
    pub process_queue: Arc<ProcessQueue>,
    pub next_offset: i64,
    /// Orderly mode: the broker lock was already held when this request was
    /// created, so the first pull may proceed without waiting for renewal
    pub previously_locked: bool,
}

/// Filtered, offset-stamped outcome of one pull
pub struct ProcessedPull {
    pub messages: Vec<MessageExt>,
    pub next_begin_offset: i64,
}

/// Decode-side processing of a raw pull result: drop messages the
/// subscription filters out client-side and stamp each survivor with the
/// queue's broker-side offset range.
pub fn process_pull_result(subscription: &Subscription, result: PullResult) -> ProcessedPull {
    let PullResult {
        next_begin_offset,
        min_offset,
        max_offset,
        messages,
        ..
    } = result;

    let messages = messages
        .into_iter()
        .filter(|m| subscription.matches(m))
        .map(|mut m| {
            m.min_offset = min_offset;
            m.max_offset = max_offset;
            m
        })
        .collect();

    ProcessedPull {
        messages,
        next_begin_offset,
    }
}

/// Single ordered work queue of pull requests, drained by a fixed pool of
/// worker loops. Requests are re-enqueued (optionally after a delay) until
/// their queue is dropped.
pub(crate) struct PullScheduler {
    shared: Arc<ConsumerShared>,
    consume: Arc<dyn ConsumeMessageService>,
    tx: mpsc::UnboundedSender<PullRequest>,
    rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PullRequest>>>,
}

impl PullScheduler {
    pub(crate) fn new(
        shared: Arc<ConsumerShared>,
        consume: Arc<dyn ConsumeMessageService>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared,
            consume,
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    /// Spawn the worker pool
    pub(crate) fn start(&self) {
        let rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("pull scheduler already started");
                return;
            }
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..self.shared.config.pull_worker_count {
            let shared = self.shared.clone();
            let consume = self.consume.clone();
            let tx = self.tx.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                debug!(worker, "pull worker started");
                loop {
                    let request = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shared.shutdown.cancelled() => break,
                            request = rx.recv() => match request {
                                Some(request) => request,
                                None => break,
                            },
                        }
                    };
                    process_request(&shared, &consume, &tx, request).await;
                }
                debug!(worker, "pull worker stopped");
            });
        }
    }

    /// Enqueue a pull request for immediate processing
    pub(crate) fn enqueue(&self, request: PullRequest) {
        let _ = self.tx.send(request);
    }
}

fn enqueue(tx: &mpsc::UnboundedSender<PullRequest>, request: PullRequest) {
    let _ = tx.send(request);
}

fn enqueue_later(
    shared: &Arc<ConsumerShared>,
    tx: &mpsc::UnboundedSender<PullRequest>,
    request: PullRequest,
    delay: Duration,
) {
    let tx = tx.clone();
    let shutdown = shared.shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = tx.send(request);
            }
        }
    });
}

async fn process_request(
    shared: &Arc<ConsumerShared>,
    consume: &Arc<dyn ConsumeMessageService>,
    tx: &mpsc::UnboundedSender<PullRequest>,
    request: PullRequest,
) {
    if shared.shutdown.is_cancelled() {
        return;
    }
    let pq = request.process_queue.clone();
    if pq.is_dropped() {
        debug!(queue = %request.queue, "queue dropped, discarding pull request");
        return;
    }
    if shared.is_suspended() {
        enqueue_later(shared, tx, request, shared.config.pull_idle_delay);
        return;
    }

    let config = &shared.config;

    // local cache backpressure: both count-based and span-based
    let cached = pq.msg_count();
    if cached >= config.pull_threshold_for_queue {
        debug!(
            queue = %request.queue,
            cached,
            "cached message count over threshold, deferring pull"
        );
        enqueue_later(shared, tx, request, config.flow_control_delay);
        return;
    }
    let span = pq.max_span();
    if span >= config.consume_max_span {
        debug!(queue = %request.queue, span, "cached offset span over threshold, deferring pull");
        enqueue_later(shared, tx, request, config.flow_control_delay);
        return;
    }

    // orderly clustering pulls wait until the broker lock is confirmed
    if shared.orderly
        && shared.config.message_model == MessageModel::Clustering
        && !pq.is_locked()
        && !request.previously_locked
    {
        debug!(queue = %request.queue, "queue not locked yet, deferring pull");
        enqueue_later(shared, tx, request, config.pull_exception_delay);
        return;
    }

    let subscription = match shared.subscriptions.get(&request.queue.topic) {
        Some(entry) => entry.value().clone(),
        None => {
            debug!(topic = %request.queue.topic, "subscription gone, discarding pull request");
            return;
        }
    };

    let pulled = shared
        .gateway
        .pull(
            &request.queue,
            &subscription.expression,
            request.next_offset,
            config.pull_batch_size,
            config.long_poll_timeout,
        )
        .await;

    match pulled {
        Ok(result) => {
            handle_pull_result(shared, consume, tx, request, &subscription, result).await
        }
        Err(ClientError::BrokerBusy { delay_ms }) => {
            debug!(queue = %request.queue, delay_ms, "broker asked to slow down");
            enqueue_later(shared, tx, request, Duration::from_millis(delay_ms));
        }
        Err(err) => {
            warn!(queue = %request.queue, error = %err, "pull failed, retrying");
            enqueue_later(shared, tx, request, config.pull_exception_delay);
        }
    }
}

async fn handle_pull_result(
    shared: &Arc<ConsumerShared>,
    consume: &Arc<dyn ConsumeMessageService>,
    tx: &mpsc::UnboundedSender<PullRequest>,
    mut request: PullRequest,
    subscription: &Subscription,
    result: PullResult,
) {
    let config = &shared.config;
    let pq = request.process_queue.clone();

    match result.status {
        PullStatus::Found => {
            let processed = process_pull_result(subscription, result);
            request.next_offset = processed.next_begin_offset;
            if processed.messages.is_empty() {
                // everything was filtered out client-side; keep going
                enqueue(tx, request);
                return;
            }
            pq.put_messages(processed.messages);
            consume.submit(request.queue.clone(), pq.clone());
            if config.pull_interval.is_zero() {
                enqueue(tx, request);
            } else {
                enqueue_later(shared, tx, request, config.pull_interval);
            }
        }
        PullStatus::NoNewMessage | PullStatus::NoMatchedMessage => {
            request.next_offset = result.next_begin_offset;
            // with nothing cached the reported offset is already safe
            if pq.msg_count() == 0 && request.next_offset >= 0 {
                shared
                    .offset_store
                    .update_offset(&request.queue, request.next_offset, true);
            }
            enqueue_later(shared, tx, request, config.pull_idle_delay);
        }
        PullStatus::OffsetIllegal => {
            let corrected = if result.next_begin_offset >= 0 {
                result.next_begin_offset
            } else {
                match shared.gateway.max_offset(&request.queue).await {
                    Ok(offset) => offset,
                    Err(err) => {
                        warn!(queue = %request.queue, error = %err, "offset re-sync failed");
                        enqueue_later(shared, tx, request, config.pull_exception_delay);
                        return;
                    }
                }
            };
            info!(
                queue = %request.queue,
                requested = request.next_offset,
                corrected,
                "pull offset illegal, re-syncing from broker"
            );
            shared
                .offset_store
                .update_offset(&request.queue, corrected, false);
            shared.offset_store.persist(&request.queue).await;
            request.next_offset = corrected;
            enqueue_later(shared, tx, request, config.pull_exception_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Subscription;
    use bytes::Bytes;

    fn pull_result(offsets: &[i64], tags: &[&str]) -> PullResult {
        let mq = MessageQueue::new("topic-a", "broker-a", 0);
        let messages = offsets
            .iter()
            .zip(tags.iter())
            .map(|(&o, &t)| {
                MessageExt::new(mq.clone(), o, Bytes::from_static(b"m")).with_tags(t)
            })
            .collect();
        PullResult {
            status: PullStatus::Found,
            next_begin_offset: offsets.last().copied().unwrap_or(0) + 1,
            min_offset: 0,
            max_offset: 100,
            messages,
        }
    }

    #[test]
    fn test_client_side_tag_filter() {
        let sub = Subscription::tags("topic-a", "tagA");
        let processed = process_pull_result(&sub, pull_result(&[1, 2, 3], &["tagA", "tagB", "tagA"]));

        let offsets: Vec<i64> = processed.messages.iter().map(|m| m.queue_offset).collect();
        assert_eq!(offsets, vec![1, 3]);
        assert_eq!(processed.next_begin_offset, 4);
    }

    #[test]
    fn test_offset_metadata_stamped() {
        let sub = Subscription::tags("topic-a", "*");
        let processed = process_pull_result(&sub, pull_result(&[7], &["tagA"]));

        assert_eq!(processed.messages[0].min_offset, 0);
        assert_eq!(processed.messages[0].max_offset, 100);
    }
}
