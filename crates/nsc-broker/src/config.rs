use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BrokerConfig {
    /// In-process bus; suitable for monolithic deployments and tests.
    #[default]
    Memory,
    #[cfg(feature = "nats")]
    Nats {
        #[serde(default = "default_nats_url")]
        url: String,
        #[serde(default)]
        name: Option<String>,
    },
}

#[cfg(feature = "nats")]
fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}
