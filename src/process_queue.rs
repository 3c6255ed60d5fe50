use crate::message::MessageExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-queue cache of pulled, not-yet-committed messages.
///
/// All content mutation goes through the internal lock, so a single instance
/// can be shared across the rebalance engine, the pull loop and multiple
/// consume workers. Cross-queue operations never contend.
pub struct ProcessQueue {
    inner: Mutex<Contents>,

    /// Set when the queue is released by rebalance; a cooperative stop signal
    dropped: AtomicBool,

    /// Orderly mode: broker lock held for this queue
    locked: AtomicBool,
    last_lock_timestamp: AtomicU64,

    last_pull_timestamp: AtomicU64,
    last_consume_timestamp: AtomicU64,

    /// Highest offset ever inserted; -1 until the first put
    queue_offset_max: AtomicI64,

    /// Serializes orderly batch processing for this queue
    consume_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Contents {
    /// offset -> message, insertion order == offset order
    messages: BTreeMap<i64, MessageExt>,
    /// Messages checked out to a consume worker but not yet acknowledged
    consuming: BTreeMap<i64, MessageExt>,
}

impl Contents {
    fn min_offset(&self) -> Option<i64> {
        match (
            self.messages.keys().next(),
            self.consuming.keys().next(),
        ) {
            (Some(&a), Some(&b)) => Some(a.min(b)),
            (Some(&a), None) => Some(a),
            (None, Some(&b)) => Some(b),
            (None, None) => None,
        }
    }

    fn max_offset(&self) -> Option<i64> {
        match (
            self.messages.keys().next_back(),
            self.consuming.keys().next_back(),
        ) {
            (Some(&a), Some(&b)) => Some(a.max(b)),
            (Some(&a), None) => Some(a),
            (None, Some(&b)) => Some(b),
            (None, None) => None,
        }
    }
}

impl Default for ProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Contents::default()),
            dropped: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            last_lock_timestamp: AtomicU64::new(now_millis()),
            last_pull_timestamp: AtomicU64::new(now_millis()),
            last_consume_timestamp: AtomicU64::new(now_millis()),
            queue_offset_max: AtomicI64::new(-1),
            consume_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Append pulled messages, keeping offset order
    pub fn put_messages(&self, messages: Vec<MessageExt>) {
        if messages.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for msg in messages {
            let offset = msg.queue_offset;
            self.queue_offset_max.fetch_max(offset, Ordering::AcqRel);
            inner.messages.insert(offset, msg);
        }
        self.last_pull_timestamp.store(now_millis(), Ordering::Release);
    }

    /// Remove up to `max_count` of the lowest-offset messages and check them
    /// out to the consuming snapshot. The cache count is unaffected until the
    /// batch is acknowledged, so backpressure still sees in-flight messages.
    pub fn take_messages(&self, max_count: usize) -> Vec<MessageExt> {
        let mut inner = self.inner.lock();
        let mut taken = Vec::with_capacity(max_count.min(inner.messages.len()));
        for _ in 0..max_count {
            match inner.messages.pop_first() {
                Some((offset, msg)) => {
                    inner.consuming.insert(offset, msg.clone());
                    taken.push(msg);
                }
                None => break,
            }
        }
        if !taken.is_empty() {
            self.last_consume_timestamp.store(now_millis(), Ordering::Release);
        }
        taken
    }

    /// Reinsert previously taken messages, preserving their offsets and
    /// delivery metadata. Used when a consumption attempt must be retried
    /// in place.
    pub fn requeue(&self, messages: Vec<MessageExt>) {
        if messages.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for msg in messages {
            let offset = msg.queue_offset;
            inner.consuming.remove(&offset);
            inner.messages.insert(offset, msg);
        }
    }

    /// Acknowledge the whole consuming snapshot and return the next offset
    /// that is safe to persist: the minimum offset still cached, or one past
    /// the last taken offset when nothing remains.
    pub fn commit(&self) -> i64 {
        let mut inner = self.inner.lock();
        let last_taken = inner.consuming.keys().next_back().copied();
        inner.consuming.clear();
        if let Some(&first) = inner.messages.keys().next() {
            return first;
        }
        match last_taken {
            Some(offset) => offset + 1,
            None => {
                let max = self.queue_offset_max.load(Ordering::Acquire);
                if max >= 0 {
                    max + 1
                } else {
                    -1
                }
            }
        }
    }

    /// Acknowledge a specific batch (concurrent mode) and return the next
    /// safe offset: the minimum offset still outstanding, one past the
    /// highest ever cached when the cache drained, or -1 when nothing was
    /// ever cached.
    pub fn remove_messages(&self, messages: &[MessageExt]) -> i64 {
        let mut inner = self.inner.lock();
        for msg in messages {
            inner.messages.remove(&msg.queue_offset);
            inner.consuming.remove(&msg.queue_offset);
        }
        if let Some(first) = inner.min_offset() {
            return first;
        }
        let max = self.queue_offset_max.load(Ordering::Acquire);
        if max >= 0 {
            max + 1
        } else {
            -1
        }
    }

    /// Discard all cached messages. Only effective once the queue has been
    /// dropped; calling it on a live queue signals caller misuse.
    pub fn clear(&self) {
        if !self.is_dropped() {
            warn!("clear() called on a process queue that is not dropped; ignoring");
            return;
        }
        let mut inner = self.inner.lock();
        inner.messages.clear();
        inner.consuming.clear();
    }

    /// Cached message count, including checked-out messages
    pub fn msg_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.messages.len() + inner.consuming.len()
    }

    /// Lowest cached offset, or -1 when empty
    pub fn cached_min_offset(&self) -> i64 {
        self.inner.lock().min_offset().unwrap_or(-1)
    }

    /// Highest cached offset, or -1 when empty
    pub fn cached_max_offset(&self) -> i64 {
        self.inner.lock().max_offset().unwrap_or(-1)
    }

    /// Offset distance between the newest and oldest cached message
    pub fn max_span(&self) -> i64 {
        let inner = self.inner.lock();
        match (inner.min_offset(), inner.max_offset()) {
            (Some(min), Some(max)) => max - min,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.messages.is_empty() && inner.consuming.is_empty()
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn set_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::Release);
        if locked {
            self.last_lock_timestamp.store(now_millis(), Ordering::Release);
        }
    }

    /// Whether the broker lock has gone stale
    pub fn is_lock_expired(&self, max_idle: Duration) -> bool {
        let last = self.last_lock_timestamp.load(Ordering::Acquire);
        now_millis().saturating_sub(last) > max_idle.as_millis() as u64
    }

    /// Milliseconds since the last successful pull for this queue
    pub fn millis_since_last_pull(&self) -> u64 {
        now_millis().saturating_sub(self.last_pull_timestamp.load(Ordering::Acquire))
    }

    /// Milliseconds since a batch was last taken for consumption
    pub fn millis_since_last_consume(&self) -> u64 {
        now_millis().saturating_sub(self.last_consume_timestamp.load(Ordering::Acquire))
    }

    /// Serializes orderly batch processing; rebalance try-locks this to
    /// detect an in-flight consume before releasing the queue
    pub fn consume_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.consume_lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageQueue;
    use bytes::Bytes;

    fn msgs(offsets: &[i64]) -> Vec<MessageExt> {
        let mq = MessageQueue::new("topic-a", "broker-a", 0);
        offsets
            .iter()
            .map(|&o| MessageExt::new(mq.clone(), o, Bytes::from_static(b"m")))
            .collect()
    }

    #[test]
    fn test_put_updates_bounds() {
        let pq = ProcessQueue::new();
        assert_eq!(pq.cached_min_offset(), -1);
        assert_eq!(pq.cached_max_offset(), -1);

        pq.put_messages(msgs(&[5, 6, 8]));
        assert_eq!(pq.msg_count(), 3);
        assert_eq!(pq.cached_min_offset(), 5);
        assert_eq!(pq.cached_max_offset(), 8);
        assert_eq!(pq.max_span(), 3);
    }

    #[test]
    fn test_remove_messages_advances_min() {
        let pq = ProcessQueue::new();
        pq.put_messages(msgs(&[5, 6, 8]));

        let batch = msgs(&[5]);
        let next = pq.remove_messages(&batch);
        assert_eq!(next, 6);
        assert_eq!(pq.cached_min_offset(), 6);
        assert_eq!(pq.msg_count(), 2);
    }

    #[test]
    fn test_remove_all_reports_one_past_max() {
        let pq = ProcessQueue::new();
        pq.put_messages(msgs(&[5, 6, 8]));
        let next = pq.remove_messages(&msgs(&[5, 6, 8]));
        assert_eq!(next, 9);
        assert!(pq.is_empty());
    }

    #[test]
    fn test_remove_on_empty_cache_is_negative() {
        let pq = ProcessQueue::new();
        assert_eq!(pq.remove_messages(&msgs(&[5])), -1);
    }

    #[test]
    fn test_take_keeps_cache_pressure() {
        let pq = ProcessQueue::new();
        pq.put_messages(msgs(&[1, 2, 3, 4]));

        let taken = pq.take_messages(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].queue_offset, 1);
        assert_eq!(taken[1].queue_offset, 2);

        // in-flight messages still count toward backpressure
        assert_eq!(pq.msg_count(), 4);
        assert_eq!(pq.cached_min_offset(), 1);
    }

    #[test]
    fn test_commit_returns_min_remaining() {
        let pq = ProcessQueue::new();
        pq.put_messages(msgs(&[1, 2, 3, 4]));

        pq.take_messages(2);
        let committed = pq.commit();
        assert_eq!(committed, 3);
        assert_eq!(pq.msg_count(), 2);

        pq.take_messages(2);
        let committed = pq.commit();
        assert_eq!(committed, 5);
        assert!(pq.is_empty());
    }

    #[test]
    fn test_requeue_restores_order_and_metadata() {
        let pq = ProcessQueue::new();
        pq.put_messages(msgs(&[10, 11, 12]));

        let taken = pq.take_messages(3);
        pq.requeue(taken);

        let again = pq.take_messages(3);
        let offsets: Vec<i64> = again.iter().map(|m| m.queue_offset).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
        assert!(again.iter().all(|m| m.reconsume_times == 0));
    }

    #[test]
    fn test_partial_remove_never_passes_outstanding() {
        let pq = ProcessQueue::new();
        pq.put_messages(msgs(&[1, 2, 3, 4]));

        let first = pq.take_messages(2); // offsets 1, 2
        let second = pq.take_messages(2); // offsets 3, 4

        // second batch finishes first: safe offset must stay at the
        // outstanding first batch
        let next = pq.remove_messages(&second);
        assert_eq!(next, 1);

        let next = pq.remove_messages(&first);
        assert_eq!(next, 5);
    }

    #[test]
    fn test_min_offset_monotone_under_put_take_commit() {
        let pq = ProcessQueue::new();
        let mut last_min = -1;
        for chunk in [&[0i64, 1, 2][..], &[3, 4][..], &[5, 6, 7][..]] {
            pq.put_messages(msgs(chunk));
            let min = pq.cached_min_offset();
            assert!(min >= last_min);
            if pq.msg_count() > 0 {
                assert!(min <= pq.cached_max_offset());
            }
            pq.take_messages(2);
            pq.commit();
            let min = pq.cached_min_offset();
            if min >= 0 {
                assert!(min >= last_min);
                last_min = min;
            }
        }
    }

    #[test]
    fn test_clear_requires_dropped() {
        let pq = ProcessQueue::new();
        pq.put_messages(msgs(&[1, 2]));

        pq.clear();
        assert_eq!(pq.msg_count(), 2); // no-op while live

        pq.set_dropped();
        pq.clear();
        assert!(pq.is_empty());
    }

    #[test]
    fn test_lock_expiry() {
        let pq = ProcessQueue::new();
        pq.set_locked(true);
        assert!(!pq.is_lock_expired(Duration::from_secs(30)));
        assert!(pq.is_lock_expired(Duration::from_millis(0)));
    }
}
