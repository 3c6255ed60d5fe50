use crate::error::{ClientError, Result};
use crate::types::MessageQueue;

/// Pluggable queue-allocation strategy for a consumer group.
///
/// Must be a pure function of its inputs: every member of the group runs it
/// independently against identically-ordered inputs and the outputs have to
/// partition the queue set without coordination.
pub trait AllocateStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute the queue subset owned by `current_id`
    fn allocate(
        &self,
        current_id: &str,
        queues: &[MessageQueue],
        consumer_ids: &[String],
    ) -> Result<Vec<MessageQueue>>;
}

/// Default strategy: contiguous, evenly divided blocks in sorted order
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocateAveragely;

impl AllocateStrategy for AllocateAveragely {
    fn name(&self) -> &'static str {
        "averagely"
    }

    fn allocate(
        &self,
        current_id: &str,
        queues: &[MessageQueue],
        consumer_ids: &[String],
    ) -> Result<Vec<MessageQueue>> {
        if current_id.is_empty() {
            return Err(ClientError::InvalidArgument(
                "current consumer id is empty".to_string(),
            ));
        }
        if queues.is_empty() {
            return Err(ClientError::InvalidArgument(
                "queue list is empty".to_string(),
            ));
        }
        if consumer_ids.is_empty() {
            return Err(ClientError::InvalidArgument(
                "consumer id list is empty".to_string(),
            ));
        }
        let index = consumer_ids
            .iter()
            .position(|id| id == current_id)
            .ok_or_else(|| {
                ClientError::InvalidArgument(format!(
                    "consumer id {} not in group member list",
                    current_id
                ))
            })?;

        let m = queues.len();
        let n = consumer_ids.len();
        let quotient = m / n;
        let remainder = m % n;

        let size = if index < remainder { quotient + 1 } else { quotient };
        let start = index * quotient + index.min(remainder);

        Ok(queues[start..(start + size).min(m)].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(n: u32) -> Vec<MessageQueue> {
        (0..n)
            .map(|i| MessageQueue::new("topic-a", "broker-a", i))
            .collect()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_seven_queues_three_consumers() {
        let strategy = AllocateAveragely;
        let all = queues(7);
        let members = ids(&["c0", "c1", "c2"]);

        let a0 = strategy.allocate("c0", &all, &members).unwrap();
        let a1 = strategy.allocate("c1", &all, &members).unwrap();
        let a2 = strategy.allocate("c2", &all, &members).unwrap();

        assert_eq!(a0.len(), 3);
        assert_eq!(a1.len(), 2);
        assert_eq!(a2.len(), 2);

        let indices: Vec<u32> = a0.iter().map(|q| q.queue_id).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_partition_no_overlap_no_gap() {
        let strategy = AllocateAveragely;
        let all = queues(10);
        let members = ids(&["c0", "c1", "c2", "c3"]);

        let mut union = Vec::new();
        for id in &members {
            union.extend(strategy.allocate(id, &all, &members).unwrap());
        }
        union.sort();
        union.dedup();
        assert_eq!(union, all);
    }

    #[test]
    fn test_more_consumers_than_queues() {
        let strategy = AllocateAveragely;
        let all = queues(2);
        let members = ids(&["c0", "c1", "c2"]);

        assert_eq!(strategy.allocate("c0", &all, &members).unwrap().len(), 1);
        assert_eq!(strategy.allocate("c1", &all, &members).unwrap().len(), 1);
        assert!(strategy.allocate("c2", &all, &members).unwrap().is_empty());
    }

    #[test]
    fn test_idempotence() {
        let strategy = AllocateAveragely;
        let all = queues(9);
        let members = ids(&["c0", "c1"]);

        let first = strategy.allocate("c1", &all, &members).unwrap();
        let second = strategy.allocate("c1", &all, &members).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_inputs() {
        let strategy = AllocateAveragely;
        let all = queues(4);
        let members = ids(&["c0"]);

        assert!(strategy.allocate("", &all, &members).is_err());
        assert!(strategy.allocate("c0", &[], &members).is_err());
        assert!(strategy.allocate("c0", &all, &[]).is_err());
        assert!(strategy.allocate("missing", &all, &members).is_err());
    }
}
