//! Event declarations and emission.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use nsc_broker::{Broker, DiscardPolicy, RetentionPolicy, StorageType};
use nsc_proto::subject::event_subject;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EmitError;

/// Events a service publishes, plus stream settings for the durable ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsDeclaration {
    #[serde(default)]
    pub list: BTreeMap<String, EventSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSettings {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub options: EventOptions,
    /// JSON schema of the event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOptions {
    /// Durable events go through a stream.
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub prefix: String,
    #[serde(default)]
    pub actions: Vec<StreamAction>,
}

/// Per-action stream overrides. Unset fields take the stream defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<RetentionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_policy: Option<DiscardPolicy>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ttl: Option<u64>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_tracking_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll_ups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<i64>,
}

impl StreamAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }
}

impl EventsDeclaration {
    pub fn with_event(mut self, name: impl Into<String>, settings: EventSettings) -> Self {
        self.list.insert(name.into(), settings);
        self
    }

    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.stream_options = Some(options);
        self
    }

    pub fn get(&self, event: &str) -> Option<&EventSettings> {
        self.list.get(event)
    }

    pub fn is_stream(&self, event: &str) -> bool {
        self.list.get(event).is_some_and(|e| e.options.stream)
    }

    /// Subject `event` is published on.
    pub fn subject(&self, service: &str, event: &str) -> Result<String, EmitError> {
        let settings = self
            .get(event)
            .ok_or_else(|| EmitError::UnknownEvent(event.to_string()))?;
        if !settings.options.stream {
            return Ok(event_subject(service, None, event));
        }
        let prefix = self
            .stream_options
            .as_ref()
            .map(|o| o.prefix.as_str())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| EmitError::MissingStreamPrefix(event.to_string()))?;
        Ok(event_subject(service, Some(prefix), event))
    }
}

impl EventSettings {
    pub fn plain(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn durable(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            options: EventOptions { stream: true },
            event: None,
        }
    }
}

/// Publishes a service's declared events.
#[derive(Clone)]
pub struct Emitter {
    service: Arc<str>,
    events: Arc<EventsDeclaration>,
    broker: Arc<dyn Broker>,
}

impl Emitter {
    pub fn new(service: impl Into<Arc<str>>, events: Arc<EventsDeclaration>, broker: Arc<dyn Broker>) -> Self {
        Self {
            service: service.into(),
            events,
            broker,
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.list.keys().map(String::as_str)
    }

    pub async fn emit<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<(), EmitError> {
        let subject = self.events.subject(&self.service, event)?;
        let body = serde_json::to_vec(payload)?;
        tracing::debug!(service = %self.service, event, subject = %subject, "emitting event");
        self.broker.publish(&subject, Bytes::from(body), None).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("service", &self.service)
            .field("events", &self.events.list.len())
            .finish()
    }
}
