//! Event listeners.
//!
//! One pump per event name. Plain events come from a broker subscription,
//! stream events from a durable consumer created on the first `on`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use nsc_broker::{Broker, BrokerError, IncomingMessage, StreamMessage, SubscribeOptions};
use nsc_proto::subject::event_subject;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RequestError, StreamError};
use crate::events::EventsDeclaration;
use crate::streams::{BatchFetcher, ConsumerHandle, ListenerOptions, SingleFetcher, StreamManager};

/// Pause before resubscribing after a consumer error.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A decoded event.
pub struct EventMessage {
    pub subject: String,
    /// JSON when the payload parses, otherwise the payload as a string.
    pub data: Value,
    source: Option<StreamMessage>,
}

impl EventMessage {
    fn plain(message: IncomingMessage) -> Self {
        Self {
            data: decode(&message.payload),
            subject: message.subject,
            source: None,
        }
    }

    fn durable(message: StreamMessage) -> Self {
        Self {
            subject: message.subject.clone(),
            data: decode(&message.payload),
            source: Some(message),
        }
    }

    /// Acknowledges a stream event. A no-op for plain events.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        match &self.source {
            Some(message) => message.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<(), BrokerError> {
        match &self.source {
            Some(message) => message.nak(delay).await,
            None => Ok(()),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.source.is_some()
    }
}

impl std::fmt::Debug for EventMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMessage")
            .field("subject", &self.subject)
            .field("data", &self.data)
            .field("durable", &self.is_durable())
            .finish()
    }
}

fn decode(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

#[derive(Debug, Clone)]
pub enum EventDelivery {
    Single(Arc<EventMessage>),
    Batch(Arc<[EventMessage]>),
}

impl EventDelivery {
    pub fn messages(&self) -> &[EventMessage] {
        match self {
            Self::Single(message) => std::slice::from_ref(message.as_ref()),
            Self::Batch(messages) => messages,
        }
    }
}

type Callback = Arc<dyn Fn(EventDelivery) -> BoxFuture<'static, ()> + Send + Sync>;
type Handlers = Arc<Mutex<Vec<(HandlerId, Callback)>>>;

struct Pump {
    handlers: Handlers,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Listens to the events of one service on behalf of a caller.
pub struct EventListener {
    caller: String,
    service: Arc<str>,
    events: Arc<EventsDeclaration>,
    broker: Arc<dyn Broker>,
    options: ListenerOptions,
    pumps: tokio::sync::Mutex<HashMap<String, Pump>>,
    next_id: AtomicU64,
}

impl EventListener {
    pub(crate) fn new(
        caller: String,
        service: Arc<str>,
        events: Arc<EventsDeclaration>,
        broker: Arc<dyn Broker>,
        options: ListenerOptions,
    ) -> Self {
        Self {
            caller,
            service,
            events,
            broker,
            options,
            pumps: tokio::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for `event`, starting its pump on first use.
    pub async fn on<F, Fut>(&self, event: &str, handler: F) -> Result<HandlerId, RequestError>
    where
        F: Fn(EventDelivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback =
            Arc::new(move |delivery: EventDelivery| -> BoxFuture<'static, ()> { Box::pin(handler(delivery)) });

        let mut pumps = self.pumps.lock().await;
        if let Some(pump) = pumps.get(event) {
            pump.handlers.lock().push((id, callback));
            return Ok(id);
        }

        let handlers: Handlers = Arc::new(Mutex::new(vec![(id, callback)]));
        let cancel = CancellationToken::new();
        let task = self.start(event, handlers.clone(), cancel.clone()).await?;
        pumps.insert(
            event.to_string(),
            Pump {
                handlers,
                cancel,
                task,
            },
        );
        Ok(id)
    }

    /// Removes a handler. The pump stops with the last handler of its event.
    pub async fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut pumps = self.pumps.lock().await;
        let Some(pump) = pumps.get(event) else {
            return false;
        };
        let (removed, empty) = {
            let mut handlers = pump.handlers.lock();
            let before = handlers.len();
            handlers.retain(|(existing, _)| *existing != id);
            (handlers.len() != before, handlers.is_empty())
        };
        if empty {
            if let Some(pump) = pumps.remove(event) {
                pump.cancel.cancel();
                tracing::debug!(event, "listener pump stopped");
            }
        }
        removed
    }

    /// Stops every pump.
    pub async fn close(&self) {
        let mut pumps = self.pumps.lock().await;
        for (event, pump) in pumps.drain() {
            pump.cancel.cancel();
            if let Err(err) = pump.task.await {
                tracing::warn!(event = %event, error = %err, "listener pump panicked");
            }
        }
    }

    pub async fn active_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.pumps.lock().await.keys().cloned().collect();
        events.sort();
        events
    }

    async fn start(
        &self,
        event: &str,
        handlers: Handlers,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, RequestError> {
        if !self.events.is_stream(event) {
            let subject = event_subject(&self.service, None, event);
            let options = SubscribeOptions {
                queue: self.options.queue.clone(),
            };
            let subscription = self
                .broker
                .subscribe(&subject, options)
                .await
                .map_err(|err| RequestError::Transport(err.to_string()))?;
            tracing::debug!(subject = %subject, caller = %self.caller, "listening to plain event");
            return Ok(tokio::spawn(plain_pump(subscription, handlers, cancel)));
        }

        let stream_options = self.events.stream_options.clone().ok_or_else(|| {
            StreamError::Configuration(format!("stream event {event} has no stream options"))
        })?;
        let manager = StreamManager::new(self.service.as_ref(), stream_options, self.broker.clone());
        let handle = manager.create_consumer(&self.caller, event, &self.options).await?;
        tracing::debug!(event, caller = %self.caller, "listening to stream event");
        Ok(match handle {
            ConsumerHandle::Single(fetcher) => tokio::spawn(single_pump(fetcher, handlers, cancel)),
            ConsumerHandle::Batch(fetcher) => tokio::spawn(batch_pump(fetcher, handlers, cancel)),
        })
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        if let Ok(pumps) = self.pumps.try_lock() {
            for pump in pumps.values() {
                pump.cancel.cancel();
            }
        }
    }
}

async fn dispatch(handlers: &Handlers, delivery: EventDelivery) {
    let callbacks: Vec<Callback> = handlers.lock().iter().map(|(_, cb)| cb.clone()).collect();
    for callback in callbacks {
        callback(delivery.clone()).await;
    }
}

async fn plain_pump(
    mut subscription: nsc_broker::Subscription<IncomingMessage>,
    handlers: Handlers,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            next = subscription.next_message() => match next {
                Some(message) => message,
                None => break,
            },
        };
        let delivery = EventDelivery::Single(Arc::new(EventMessage::plain(message)));
        dispatch(&handlers, delivery).await;
    }
}

async fn single_pump(fetcher: SingleFetcher, handlers: Handlers, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let mut subscription = match fetcher.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(durable = fetcher.durable(), error = %err, "consumer subscribe failed");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(RETRY_DELAY) => continue,
                }
            }
        };
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => return,
                next = subscription.next_message() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            let delivery = EventDelivery::Single(Arc::new(EventMessage::durable(message)));
            dispatch(&handlers, delivery).await;
        }
        tracing::debug!(durable = fetcher.durable(), "consumer delivery ended, resubscribing");
    }
}

async fn batch_pump(fetcher: BatchFetcher, handlers: Handlers, cancel: CancellationToken) {
    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => break,
            batch = fetcher.fetch() => batch,
        };
        match batch {
            Ok(batch) if batch.is_empty() => {}
            Ok(batch) => {
                let messages: Arc<[EventMessage]> =
                    batch.into_iter().map(EventMessage::durable).collect();
                dispatch(&handlers, EventDelivery::Batch(messages)).await;
            }
            Err(err) => {
                tracing::warn!(durable = fetcher.durable(), error = %err, "batch fetch failed");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
}
