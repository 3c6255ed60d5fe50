use crate::client::PushConsumer;
use crate::error::{ClientError, Result};
use dashmap::DashMap;
use std::sync::{Arc, Weak};

/// Explicit registry of consumer instances keyed by client ID.
///
/// Holds weak references only; strong ownership stays with the caller, so a
/// dropped consumer disappears from lookups on its own.
#[derive(Default)]
pub struct ClientRegistry {
    entries: DashMap<String, Weak<crate::client::ConsumerInner>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer under its client ID; a live duplicate is rejected
    pub fn register(&self, consumer: &PushConsumer) -> Result<()> {
        let client_id = consumer.client_id().to_string();
        if let Some(existing) = self.entries.get(&client_id) {
            if existing.value().upgrade().is_some() {
                return Err(ClientError::InvalidArgument(format!(
                    "client id {} is already registered",
                    client_id
                )));
            }
        }
        self.entries
            .insert(client_id, Arc::downgrade(&consumer.inner));
        Ok(())
    }

    /// Look up a live consumer by client ID
    pub fn get(&self, client_id: &str) -> Option<PushConsumer> {
        let entry = self.entries.get(client_id)?;
        entry
            .value()
            .upgrade()
            .map(|inner| PushConsumer { inner })
    }

    /// Remove a registration; returns whether an entry existed
    pub fn unregister(&self, client_id: &str) -> bool {
        self.entries.remove(client_id).is_some()
    }

    /// Drop entries whose consumer is gone and return the live count
    pub fn prune(&self) -> usize {
        self.entries
            .retain(|_, entry| entry.upgrade().is_some());
        self.entries.len()
    }
}
