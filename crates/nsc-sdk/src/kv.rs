//! Key-value buckets declared by a service.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use nsc_broker::{Broker, BrokerError, KvBucket, KvBucketConfig, StorageType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvBucketOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<i64>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageType>,
}

impl From<&KvBucketOptions> for KvBucketConfig {
    fn from(options: &KvBucketOptions) -> Self {
        KvBucketConfig {
            history: options.history,
            ttl: options.ttl.filter(|s| *s > 0).map(Duration::from_secs),
            max_bytes: options.max_bytes,
            max_value_size: options.max_value_size,
            storage: options.storage,
        }
    }
}

pub struct KvManager {
    broker: Arc<dyn Broker>,
    buckets: BTreeMap<String, KvBucketOptions>,
}

impl KvManager {
    pub fn new(broker: Arc<dyn Broker>, buckets: BTreeMap<String, KvBucketOptions>) -> Self {
        Self { broker, buckets }
    }

    /// Binds every declared bucket, creating the ones that do not exist.
    pub async fn create_buckets(&self) -> Result<HashMap<String, Arc<dyn KvBucket>>, BrokerError> {
        let store = self.broker.key_value();
        let mut bound = HashMap::with_capacity(self.buckets.len());
        for (name, options) in &self.buckets {
            let bucket = store.bucket(name, options.into()).await?;
            tracing::debug!(bucket = %name, "key-value bucket ready");
            bound.insert(name.clone(), bucket);
        }
        Ok(bound)
    }
}
