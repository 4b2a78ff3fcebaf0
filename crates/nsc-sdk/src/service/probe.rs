//! Orchestration probe and broker status watcher.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use nsc_broker::{Broker, BrokerKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;

async fn healthcheck(State(alive): State<Arc<AtomicBool>>) -> StatusCode {
    if alive.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

pub(crate) fn router(alive: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .with_state(alive)
}

/// Serves `GET /healthcheck` on `port`.
///
/// A port already in use is tolerated for in-process brokers, where several
/// services share one process; otherwise it is fatal.
pub(crate) async fn start(
    port: u16,
    alive: Arc<AtomicBool>,
    broker_kind: BrokerKind,
    cancel: CancellationToken,
) -> Result<Option<JoinHandle<()>>, ServiceError> {
    let addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) if broker_kind == BrokerKind::InProcess => {
            tracing::warn!(port, error = %err, "probe port unavailable, continuing without probe");
            return Ok(None);
        }
        Err(err) => {
            return Err(ServiceError::FatalStartup(format!(
                "cannot bind probe port {port}: {err}"
            )))
        }
    };
    tracing::info!(port, "probe listening");

    Ok(Some(tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, router(alive))
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::warn!(error = %err, "probe server stopped");
        }
    })))
}

/// Logs broker status events until cancelled.
pub(crate) fn watch_status(broker: &Arc<dyn Broker>, service: Arc<str>, cancel: CancellationToken) -> JoinHandle<()> {
    let mut events = broker.status();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) if event.kind.is_routine() => {
                    tracing::debug!(service = %service, kind = ?event.kind, data = %event.data, "broker status");
                }
                Ok(event) => {
                    tracing::warn!(service = %service, kind = ?event.kind, data = %event.data, "broker status");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(service = %service, skipped, "status events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn probe(alive: bool) -> StatusCode {
        let app = router(Arc::new(AtomicBool::new(alive)));
        let response = app
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn healthcheck_reflects_liveness() {
        assert_eq!(probe(true).await, StatusCode::OK);
        assert_eq!(probe(false).await, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
