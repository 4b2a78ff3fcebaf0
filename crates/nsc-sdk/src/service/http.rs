//! HTTP route table for streaming methods.
//!
//! Every route is `POST /<service>/<action>`. Lookup happens in a fallback
//! handler so action names never need to be valid axum path patterns.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::{StreamExt, TryStreamExt};
use nsc_proto::subject::{http_path, method_subject};
use nsc_proto::{build_error_envelope, content_type, Baggage, Envelope, ErrorSource};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatch::Dispatcher;
use crate::method::MethodDescriptor;
use crate::payload::Payload;

struct Routes {
    dispatcher: Arc<Dispatcher>,
    by_path: HashMap<String, MethodDescriptor>,
}

pub(crate) fn router(dispatcher: Arc<Dispatcher>, methods: Vec<MethodDescriptor>) -> Router {
    let by_path = methods
        .into_iter()
        .map(|method| (http_path(&method_subject(&dispatcher.name, method.action())), method))
        .collect();
    Router::new().fallback(route).with_state(Arc::new(Routes {
        dispatcher,
        by_path,
    }))
}

fn envelope_response(status: StatusCode, envelope: &Envelope) -> Response {
    let body = envelope.encode().unwrap_or_default();
    (status, [(CONTENT_TYPE, content_type::JSON)], body).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    envelope_response(status, &build_error_envelope(ErrorSource::Message(message), None))
}

async fn route(
    State(routes): State<Arc<Routes>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(descriptor) = routes.by_path.get(uri.path()) else {
        return error_response(StatusCode::NOT_FOUND, &format!("no method at {}", uri.path()));
    };
    if method != Method::POST {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "only POST is supported");
    }

    let request = if descriptor.settings().streams_request() {
        Payload::Stream(body.into_data_stream().map_err(io::Error::other).boxed())
    } else {
        match read_json(body).await {
            Ok(value) => Payload::Json(value),
            Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
        }
    };

    let baggage = Baggage::from_headers(&headers);
    match routes.dispatcher.handled(descriptor, request, baggage).await {
        Ok(Payload::Stream(stream)) => (
            StatusCode::OK,
            [(CONTENT_TYPE, content_type::OCTET_STREAM)],
            Body::from_stream(stream),
        )
            .into_response(),
        Ok(Payload::Json(value)) => envelope_response(StatusCode::OK, &Envelope::ok(value)),
        Err(err) => envelope_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &build_error_envelope(ErrorSource::Message(&err.message), err.code),
        ),
    }
}

async fn read_json(body: Body) -> Result<Value, String> {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|err| format!("cannot read request body: {err}"))?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|err| format!("request body is not JSON: {err}"))
}

/// Binds an ephemeral port on `host` and serves `router` until cancelled.
pub(crate) async fn serve(
    router: Router,
    host: IpAddr,
    cancel: CancellationToken,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::new(host, 0)).await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::warn!(error = %err, "HTTP listener stopped");
        }
    });
    Ok((addr, task))
}

/// Address clients should use to reach a listener bound on `host`.
pub(crate) async fn advertised_ip(host: IpAddr, configured: Option<IpAddr>) -> IpAddr {
    if let Some(ip) = configured {
        return ip;
    }
    if !host.is_unspecified() {
        return host;
    }
    detect_ip().await.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Outbound interface address. Connecting a UDP socket sends nothing.
async fn detect_ip() -> Option<IpAddr> {
    let socket = tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}
