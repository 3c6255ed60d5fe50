use crate::types::MessageQueue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message as seen by the consumer, with queue position and delivery state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageExt {
    /// Broker-assigned message ID
    pub msg_id: String,

    /// Queue the message was pulled from
    pub queue: MessageQueue,

    /// Position of the message within its queue
    pub queue_offset: i64,

    /// Tag used for filtering, if any
    pub tags: Option<String>,

    /// Business keys, if any
    pub keys: Option<String>,

    /// Message payload
    pub body: Bytes,

    /// User properties
    pub properties: HashMap<String, String>,

    /// Timestamp when the message was produced (ms)
    pub born_timestamp: u64,

    /// Timestamp when the broker stored the message (ms)
    pub store_timestamp: u64,

    /// How many times delivery has been attempted before this one
    pub reconsume_times: i32,

    /// Queue minimum offset reported by the broker at pull time
    pub min_offset: i64,

    /// Queue maximum offset reported by the broker at pull time
    pub max_offset: i64,
}

impl MessageExt {
    /// Create a message at a queue position; remaining fields take defaults
    pub fn new(queue: MessageQueue, queue_offset: i64, body: Bytes) -> Self {
        Self {
            msg_id: String::new(),
            queue,
            queue_offset,
            tags: None,
            keys: None,
            body,
            properties: HashMap::new(),
            born_timestamp: 0,
            store_timestamp: 0,
            reconsume_times: 0,
            min_offset: -1,
            max_offset: -1,
        }
    }

    /// Set the message ID
    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = msg_id.into();
        self
    }

    /// Set the filter tag
    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    /// Set the business keys
    pub fn with_keys(mut self, keys: impl Into<String>) -> Self {
        self.keys = Some(keys.into());
        self
    }

    /// Add a user property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Get message payload as string (UTF-8)
    pub fn body_as_string(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }

    /// Get a user property value
    pub fn get_property(&self, key: &str) -> Option<&String> {
        self.properties.get(key)
    }

    /// Message payload size in bytes
    pub fn body_size(&self) -> usize {
        self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder_helpers() {
        let mq = MessageQueue::new("topic-a", "broker-a", 2);
        let msg = MessageExt::new(mq.clone(), 42, Bytes::from_static(b"payload"))
            .with_msg_id("id-1")
            .with_tags("tagA")
            .with_keys("k1")
            .with_property("region", "us");

        assert_eq!(msg.queue, mq);
        assert_eq!(msg.queue_offset, 42);
        assert_eq!(msg.msg_id, "id-1");
        assert_eq!(msg.tags.as_deref(), Some("tagA"));
        assert_eq!(msg.keys.as_deref(), Some("k1"));
        assert_eq!(msg.get_property("region"), Some(&"us".to_string()));
        assert_eq!(msg.body_as_string().unwrap(), "payload");
        assert_eq!(msg.reconsume_times, 0);
    }
}
