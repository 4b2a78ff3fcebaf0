//! Response caching for cacheable methods.
//!
//! Keys are `CACHE:<subject>:<sha256 hex of subject and JSON request>`. Lookups run
//! on their own task and are raced against a short timeout; a slow backend
//! degrades to a cache miss without cancelling the lookup. Stores are
//! fire-and-forget.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores `value`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct CacheSettings {
    pub backend: Arc<dyn CacheBackend>,
    /// Upper bound on how long a lookup may delay a request.
    pub timeout: Duration,
}

impl CacheSettings {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Looks up `key`, treating errors, malformed entries and slow backends as misses.
    pub async fn lookup(&self, key: &str) -> Option<Value> {
        let backend = Arc::clone(&self.backend);
        let owned = key.to_owned();
        let lookup = tokio::spawn(async move { backend.get(&owned).await });

        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Ok(Some(raw)))) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::debug!(key, error = %err, "ignoring malformed cache entry");
                    None
                }
            },
            Ok(Ok(Ok(None))) => None,
            Ok(Ok(Err(err))) => {
                tracing::debug!(key, error = %err, "cache lookup failed");
                None
            }
            Ok(Err(err)) => {
                tracing::debug!(key, error = %err, "cache lookup task failed");
                None
            }
            Err(_) => {
                tracing::debug!(key, timeout_ms = self.timeout.as_millis() as u64, "cache lookup timed out");
                None
            }
        }
    }

    /// Stores `value` in the background.
    pub fn store(&self, key: String, value: &Value, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!(key, error = %err, "response not cacheable");
                return;
            }
        };
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(err) = backend.set(&key, raw, Some(ttl)).await {
                tracing::debug!(key, error = %err, "cache store failed");
            }
        });
    }
}

impl fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSettings")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Cache key for a request to `subject`.
pub fn cache_key(subject: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("CACHE:{subject}:{hex}")
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process cache backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    data: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .read()
            .await
            .values()
            .filter(|entry| entry.expires_at.map_or(true, |exp| now < exp))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if entry.expires_at.is_some_and(|exp| Instant::now() >= exp) => {
                drop(data);
                self.data.write().await.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    /// Expired entries are swept on every write.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut data = self.data.write().await;
        data.retain(|_, entry| entry.expires_at.map_or(true, |exp| now < exp));
        data.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|d| now + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.data.write().await.remove(key);
        Ok(())
    }
}
