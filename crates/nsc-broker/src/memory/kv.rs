use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::BrokerError;
use crate::traits::{KvBucket, KvStore};
use crate::types::{KvBucketConfig, KvEntry};

#[derive(Debug, Clone)]
struct Revision {
    value: Option<Bytes>,
    revision: u64,
    expires_at: Option<Instant>,
}

impl Revision {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

#[derive(Debug, Default)]
struct BucketState {
    revision: u64,
    keys: HashMap<String, Vec<Revision>>,
}

#[derive(Debug)]
pub struct MemoryBucket {
    name: String,
    config: KvBucketConfig,
    state: RwLock<BucketState>,
}

impl MemoryBucket {
    pub fn new(name: impl Into<String>, config: KvBucketConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(BucketState::default()),
        }
    }

    fn history(&self) -> usize {
        self.config
            .history
            .and_then(|h| usize::try_from(h).ok())
            .filter(|h| *h > 0)
            .unwrap_or(1)
    }

    async fn record(&self, key: &str, value: Option<Bytes>) -> Result<u64, BrokerError> {
        if let (Some(value), Some(max)) = (&value, self.config.max_value_size) {
            if usize::try_from(max).is_ok_and(|max| value.len() > max) {
                return Err(BrokerError::Backend(format!(
                    "value exceeds maximum size of {max} bytes"
                )));
            }
        }

        let keep = self.history();
        let mut state = self.state.write().await;
        state.revision += 1;
        let revision = state.revision;
        let expires_at = self.config.ttl.map(|ttl| Instant::now() + ttl);
        let revisions = state.keys.entry(key.to_string()).or_default();
        revisions.push(Revision {
            value,
            revision,
            expires_at,
        });
        if revisions.len() > keep {
            let excess = revisions.len() - keep;
            revisions.drain(..excess);
        }
        Ok(revision)
    }
}

fn to_entry(key: &str, revision: &Revision) -> Option<KvEntry> {
    revision.value.as_ref().map(|value| KvEntry {
        key: key.to_string(),
        value: value.clone(),
        revision: revision.revision,
    })
}

#[async_trait]
impl KvBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>, BrokerError> {
        let state = self.state.read().await;
        let now = Instant::now();
        Ok(state
            .keys
            .get(key)
            .and_then(|revisions| revisions.last())
            .filter(|r| r.is_live(now))
            .and_then(|r| to_entry(key, r)))
    }

    async fn get_revision(&self, key: &str, revision: u64) -> Result<Option<KvEntry>, BrokerError> {
        let state = self.state.read().await;
        let now = Instant::now();
        Ok(state
            .keys
            .get(key)
            .and_then(|revisions| revisions.iter().find(|r| r.revision == revision))
            .filter(|r| r.is_live(now))
            .and_then(|r| to_entry(key, r)))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64, BrokerError> {
        self.record(key, Some(value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.record(key, None).await.map(|_| ())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    buckets: RwLock<HashMap<String, Arc<MemoryBucket>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn bucket(
        &self,
        name: &str,
        config: KvBucketConfig,
    ) -> Result<Arc<dyn KvBucket>, BrokerError> {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBucket::new(name, config)))
            .clone();
        Ok(bucket)
    }
}
