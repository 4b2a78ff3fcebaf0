use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::traits::Broker;

#[cfg(feature = "memory")]
use crate::memory::MemoryBroker;

#[cfg(feature = "nats")]
use crate::nats::NatsBroker;

/// Builds the broker selected by `config`.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn Broker>, BrokerError> {
    match config {
        #[cfg(feature = "memory")]
        BrokerConfig::Memory => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(not(feature = "memory"))]
        BrokerConfig::Memory => Err(BrokerError::Backend(
            "memory broker requires the 'memory' feature".to_string(),
        )),
        #[cfg(feature = "nats")]
        BrokerConfig::Nats { url, name } => {
            let broker = NatsBroker::connect(url, name.as_deref()).await?;
            Ok(Arc::new(broker))
        }
    }
}
