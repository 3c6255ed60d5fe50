use crate::error::{ClientError, Result};
use crate::gateway::BrokerGateway;
use crate::types::MessageQueue;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How to resolve an offset read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOffsetType {
    /// In-memory table only
    ReadFromMemory,
    /// Durable backend only
    ReadFromStore,
    /// In-memory first, falling back to the durable backend
    MemoryFirstThenStore,
}

/// Durable mapping from queue to last-committed offset.
///
/// The in-memory table and the durable resource are guarded by separate
/// locks: persistence batches offsets from many queues and must not contend
/// with per-queue commit traffic.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Load previously persisted offsets into memory
    async fn load(&self) -> Result<()>;

    /// Record an offset; `increase_only` keeps the larger of old and new
    fn update_offset(&self, queue: &MessageQueue, offset: i64, increase_only: bool);

    /// Read an offset; -1 when unknown
    async fn read_offset(&self, queue: &MessageQueue, read_type: ReadOffsetType) -> i64;

    /// Persist the offset of one queue
    async fn persist(&self, queue: &MessageQueue);

    /// Persist the offsets of the given queues
    async fn persist_all(&self, queues: &[MessageQueue]);

    /// Forget a queue that is no longer assigned to this instance
    async fn remove_offset(&self, queue: &MessageQueue);
}

/// Serialized form of a queue key inside the offset document
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueKey {
    topic: String,
    broker_name: String,
    queue_id: u32,
}

impl From<&MessageQueue> for QueueKey {
    fn from(mq: &MessageQueue) -> Self {
        Self {
            topic: mq.topic.clone(),
            broker_name: mq.broker_name.clone(),
            queue_id: mq.queue_id,
        }
    }
}

impl From<QueueKey> for MessageQueue {
    fn from(key: QueueKey) -> Self {
        MessageQueue::new(key.topic, key.broker_name, key.queue_id)
    }
}

/// On-disk document: offsets keyed by the serialized queue identity
#[derive(Default, Serialize, Deserialize)]
struct OffsetDocument {
    #[serde(rename = "offsetTable")]
    offset_table: HashMap<String, i64>,
}

/// File-backed offset store for broadcasting deployments.
///
/// Writes are atomic: the document goes to a `.tmp` file, the previous
/// version is kept as `.bak`, and the temp file is renamed into place. An
/// unreadable primary file falls back to the backup on load.
pub struct LocalFileOffsetStore {
    group: String,
    store_path: PathBuf,
    table: Mutex<HashMap<MessageQueue, i64>>,
    /// Serializes file I/O, independent of the table lock
    file_lock: Mutex<()>,
}

impl LocalFileOffsetStore {
    /// Create a store rooted at the default per-client directory
    pub fn new(client_id: &str, group: &str) -> Self {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let dir = base.join(".pullmq_offsets").join(client_id).join(group);
        Self::with_dir(group, dir)
    }

    /// Create a store rooted at an explicit directory
    pub fn with_dir(group: &str, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            group: group.to_string(),
            store_path: dir.join("offsets.json"),
            table: Mutex::new(HashMap::new()),
            file_lock: Mutex::new(()),
        }
    }

    /// Path of the primary offset file
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.store_path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.store_path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn read_document(path: &Path) -> Result<HashMap<MessageQueue, i64>> {
        let raw = std::fs::read(path)?;
        let doc: OffsetDocument = serde_json::from_slice(&raw)?;
        let mut table = HashMap::with_capacity(doc.offset_table.len());
        for (key, offset) in doc.offset_table {
            let parsed: QueueKey = serde_json::from_str(&key)?;
            table.insert(parsed.into(), offset);
        }
        Ok(table)
    }

    /// Read the durable table, trying the backup when the primary fails
    fn read_local_offsets(&self) -> HashMap<MessageQueue, i64> {
        let _io = self.file_lock.lock();
        match Self::read_document(&self.store_path) {
            Ok(table) => table,
            Err(err) => {
                debug!(
                    path = %self.store_path.display(),
                    error = %err,
                    "primary offset file unreadable, trying backup"
                );
                match Self::read_document(&self.backup_path()) {
                    Ok(table) => table,
                    Err(bak_err) => {
                        debug!(error = %bak_err, "backup offset file unreadable");
                        HashMap::new()
                    }
                }
            }
        }
    }

    fn write_snapshot(&self, snapshot: &HashMap<MessageQueue, i64>) -> Result<()> {
        let mut doc = OffsetDocument::default();
        for (mq, offset) in snapshot {
            let key = serde_json::to_string(&QueueKey::from(mq))?;
            doc.offset_table.insert(key, *offset);
        }
        let payload = serde_json::to_vec_pretty(&doc)?;

        let _io = self.file_lock.lock();
        if let Some(dir) = self.store_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.tmp_path();
        std::fs::write(&tmp, payload)?;
        // keep the previous version around as the backup copy
        match std::fs::rename(&self.store_path, self.backup_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        std::fs::rename(&tmp, &self.store_path)?;
        Ok(())
    }

    fn persist_snapshot(&self, snapshot: HashMap<MessageQueue, i64>) {
        if snapshot.is_empty() {
            return;
        }
        if let Err(err) = self.write_snapshot(&snapshot) {
            // keep the in-memory table; a later persist pass retries
            warn!(group = %self.group, error = %err, "failed to persist offsets");
        }
    }
}

#[async_trait]
impl OffsetStore for LocalFileOffsetStore {
    async fn load(&self) -> Result<()> {
        let loaded = self.read_local_offsets();
        if !loaded.is_empty() {
            for (mq, offset) in &loaded {
                info!(group = %self.group, queue = %mq, offset, "loaded consumer offset");
            }
            *self.table.lock() = loaded;
        }
        Ok(())
    }

    fn update_offset(&self, queue: &MessageQueue, offset: i64, increase_only: bool) {
        let mut table = self.table.lock();
        let entry = table.entry(queue.clone()).or_insert(offset);
        if increase_only {
            if offset > *entry {
                *entry = offset;
            }
        } else {
            *entry = offset;
        }
    }

    async fn read_offset(&self, queue: &MessageQueue, read_type: ReadOffsetType) -> i64 {
        match read_type {
            ReadOffsetType::ReadFromMemory | ReadOffsetType::MemoryFirstThenStore => {
                if let Some(&offset) = self.table.lock().get(queue) {
                    return offset;
                }
                if read_type == ReadOffsetType::ReadFromMemory {
                    return -1;
                }
                match self.read_local_offsets().get(queue) {
                    Some(&offset) => {
                        self.update_offset(queue, offset, false);
                        offset
                    }
                    None => -1,
                }
            }
            ReadOffsetType::ReadFromStore => match self.read_local_offsets().get(queue) {
                Some(&offset) => {
                    self.update_offset(queue, offset, false);
                    offset
                }
                None => -1,
            },
        }
    }

    async fn persist(&self, queue: &MessageQueue) {
        let snapshot = {
            let table = self.table.lock();
            if !table.contains_key(queue) {
                return;
            }
            table.clone()
        };
        self.persist_snapshot(snapshot);
    }

    async fn persist_all(&self, queues: &[MessageQueue]) {
        if queues.is_empty() {
            return;
        }
        let snapshot = {
            let table = self.table.lock();
            queues
                .iter()
                .filter_map(|mq| table.get(mq).map(|&offset| (mq.clone(), offset)))
                .collect::<HashMap<_, _>>()
        };
        self.persist_snapshot(snapshot);
    }

    async fn remove_offset(&self, queue: &MessageQueue) {
        let snapshot = {
            let mut table = self.table.lock();
            if table.remove(queue).is_none() {
                return;
            }
            table.clone()
        };
        debug!(group = %self.group, queue = %queue, "removed offset entry");
        self.persist_snapshot(snapshot);
    }
}

/// Broker-backed offset store for clustering deployments
pub struct RemoteBrokerOffsetStore {
    group: String,
    gateway: Arc<dyn BrokerGateway>,
    table: Mutex<HashMap<MessageQueue, i64>>,
}

impl RemoteBrokerOffsetStore {
    pub fn new(group: &str, gateway: Arc<dyn BrokerGateway>) -> Self {
        Self {
            group: group.to_string(),
            gateway,
            table: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_remote(&self, queue: &MessageQueue) -> Result<i64> {
        let offset = self.gateway.query_offset(&self.group, queue).await?;
        if offset < 0 {
            return Err(ClientError::OffsetStore(format!(
                "no committed offset for {}",
                queue
            )));
        }
        Ok(offset)
    }
}

#[async_trait]
impl OffsetStore for RemoteBrokerOffsetStore {
    async fn load(&self) -> Result<()> {
        // remote offsets are queried lazily, at queue-assignment time
        Ok(())
    }

    fn update_offset(&self, queue: &MessageQueue, offset: i64, increase_only: bool) {
        let mut table = self.table.lock();
        let entry = table.entry(queue.clone()).or_insert(offset);
        if increase_only {
            if offset > *entry {
                *entry = offset;
            }
        } else {
            *entry = offset;
        }
    }

    async fn read_offset(&self, queue: &MessageQueue, read_type: ReadOffsetType) -> i64 {
        match read_type {
            ReadOffsetType::ReadFromMemory | ReadOffsetType::MemoryFirstThenStore => {
                if let Some(&offset) = self.table.lock().get(queue) {
                    return offset;
                }
                if read_type == ReadOffsetType::ReadFromMemory {
                    return -1;
                }
                match self.fetch_remote(queue).await {
                    Ok(offset) => {
                        self.update_offset(queue, offset, false);
                        offset
                    }
                    Err(err) => {
                        debug!(queue = %queue, error = %err, "remote offset unavailable");
                        -1
                    }
                }
            }
            ReadOffsetType::ReadFromStore => match self.fetch_remote(queue).await {
                Ok(offset) => {
                    self.update_offset(queue, offset, false);
                    offset
                }
                Err(err) => {
                    debug!(queue = %queue, error = %err, "remote offset unavailable");
                    -1
                }
            },
        }
    }

    async fn persist(&self, queue: &MessageQueue) {
        let offset = match self.table.lock().get(queue) {
            Some(&offset) => offset,
            None => return,
        };
        if let Err(err) = self.gateway.update_offset(&self.group, queue, offset).await {
            // retried on the next persist pass; memory keeps the value
            warn!(queue = %queue, offset, error = %err, "offset commit to broker failed");
        }
    }

    async fn persist_all(&self, queues: &[MessageQueue]) {
        for queue in queues {
            self.persist(queue).await;
        }
    }

    async fn remove_offset(&self, queue: &MessageQueue) {
        self.table.lock().remove(queue);
        debug!(group = %self.group, queue = %queue, "removed offset entry");
    }
}
