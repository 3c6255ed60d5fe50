use crate::message::MessageExt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a single broker-owned queue: (topic, broker name, queue index).
///
/// Totally ordered (lexicographic on the tuple) so that every consumer in a
/// group sorts the same queue list identically during rebalance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageQueue {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: u32,
}

impl MessageQueue {
    /// Create a new MessageQueue
    pub fn new(topic: impl Into<String>, broker_name: impl Into<String>, queue_id: u32) -> Self {
        Self {
            topic: topic.into(),
            broker_name: broker_name.into(),
            queue_id,
        }
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.topic, self.broker_name, self.queue_id)
    }
}

/// Outcome of a single remote pull
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PullStatus {
    /// Messages were found and returned
    Found,
    /// No new message at the requested offset
    NoNewMessage,
    /// Messages existed but none matched the server-side filter
    NoMatchedMessage,
    /// The requested offset is outside the queue's valid range
    OffsetIllegal,
}

/// Raw result of a remote pull, before client-side processing
#[derive(Debug, Clone)]
pub struct PullResult {
    pub status: PullStatus,
    /// Offset the next pull should start from
    pub next_begin_offset: i64,
    /// Broker-side minimum offset of the queue at pull time
    pub min_offset: i64,
    /// Broker-side maximum offset of the queue at pull time
    pub max_offset: i64,
    pub messages: Vec<MessageExt>,
}

/// Result returned by user message-processing callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeResult {
    /// The batch was fully handled
    Success,
    /// The batch should be delivered again later
    ReconsumeLater,
}

/// Filter expression dialect for a subscription
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExpressionType {
    /// Tag expression: `"*"` or `"tagA || tagB"`
    Tag,
    /// SQL92 property filter, evaluated broker-side
    Sql92,
}

/// A single topic subscription with its filter expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    pub expression: String,
    pub filter_type: ExpressionType,
}

impl Subscription {
    /// Subscribe to a topic with a tag expression (`"*"` matches everything)
    pub fn tags(topic: impl Into<String>, expression: impl Into<String>) -> Self {
        let expression = expression.into();
        let expression = if expression.is_empty() {
            "*".to_string()
        } else {
            expression
        };
        Self {
            topic: topic.into(),
            expression,
            filter_type: ExpressionType::Tag,
        }
    }

    /// Subscribe to a topic with a SQL92 property filter
    pub fn sql(topic: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            expression: expression.into(),
            filter_type: ExpressionType::Sql92,
        }
    }

    /// Client-side filter check for a pulled message.
    ///
    /// Tag subscriptions are re-checked here because the broker may return a
    /// superset when its filter data lags. SQL92 filtering is broker-only, so
    /// those messages always pass.
    pub fn matches(&self, message: &MessageExt) -> bool {
        match self.filter_type {
            ExpressionType::Sql92 => true,
            ExpressionType::Tag => {
                if self.expression == "*" {
                    return true;
                }
                match message.tags.as_deref() {
                    Some(tag) if !tag.is_empty() => {
                        self.expression.split("||").any(|t| t.trim() == tag)
                    }
                    _ => false,
                }
            }
        }
    }
}

/// Where to start consuming when no committed offset exists for a queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsumeFromWhere {
    /// Resume from the last committed offset, or the queue tail if none
    LastOffset,
    /// Resume from the last committed offset, or the queue head if none
    FirstOffset,
    /// Resume from the offset closest to the given timestamp (ms)
    Timestamp(u64),
}

/// Deployment mode of the consumer group
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageModel {
    /// Queues are partitioned across group members; offsets live on the broker
    Clustering,
    /// Every instance consumes all queues; offsets live in a local file
    Broadcasting,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageExt;
    use bytes::Bytes;

    fn msg_with_tag(tag: Option<&str>) -> MessageExt {
        let mut m = MessageExt::new(
            MessageQueue::new("topic-a", "broker-a", 0),
            0,
            Bytes::from_static(b"x"),
        );
        m.tags = tag.map(|t| t.to_string());
        m
    }

    #[test]
    fn test_message_queue_ordering() {
        let a = MessageQueue::new("t", "broker-a", 1);
        let b = MessageQueue::new("t", "broker-a", 2);
        let c = MessageQueue::new("t", "broker-b", 0);
        assert!(a < b);
        assert!(b < c);

        let mut queues = vec![c.clone(), a.clone(), b.clone()];
        queues.sort();
        assert_eq!(queues, vec![a, b, c]);
    }

    #[test]
    fn test_tag_subscription_matching() {
        let sub = Subscription::tags("topic-a", "tagA || tagB");
        assert!(sub.matches(&msg_with_tag(Some("tagA"))));
        assert!(sub.matches(&msg_with_tag(Some("tagB"))));
        assert!(!sub.matches(&msg_with_tag(Some("tagC"))));
        assert!(!sub.matches(&msg_with_tag(None)));

        let wildcard = Subscription::tags("topic-a", "");
        assert_eq!(wildcard.expression, "*");
        assert!(wildcard.matches(&msg_with_tag(None)));
    }

    #[test]
    fn test_sql_subscription_passes_client_side() {
        let sub = Subscription::sql("topic-a", "region = 'us'");
        assert!(sub.matches(&msg_with_tag(None)));
    }
}
