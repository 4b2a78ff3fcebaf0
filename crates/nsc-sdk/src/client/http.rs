//! Direct HTTP transport for streaming methods.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use nsc_proto::subject::{http_path, http_settings_subject};
use nsc_proto::{content_type, Baggage, Envelope, HttpSettings};
use reqwest::header::CONTENT_TYPE;
use tokio::time::{timeout_at, Instant};

use super::{ClientParts, Reply};
use crate::payload::Payload;

/// Upper bound on the `get_http_settings` lookup.
const SETTINGS_TIMEOUT: Duration = Duration::from_secs(1);

/// Asks the target service where its HTTP listener is.
async fn resolve(parts: &ClientParts, service: &str, timeout: Duration) -> Result<HttpSettings, String> {
    let subject = http_settings_subject(service);
    let reply = parts
        .broker
        .request(&subject, Bytes::new(), timeout.min(SETTINGS_TIMEOUT))
        .await
        .map_err(|err| format!("cannot resolve HTTP settings of {service}: {err}"))?;
    serde_json::from_slice(&reply).map_err(|err| format!("malformed HTTP settings from {service}: {err}"))
}

/// Posts `payload` to the target's HTTP listener.
///
/// `timeout` bounds the exchange up to the response headers and the read of
/// a buffered body. A streamed response body is handed back as it arrives
/// and is not cut off by the deadline.
pub(super) async fn send(
    parts: &ClientParts,
    subject: &str,
    payload: Payload,
    baggage: &Baggage,
    timeout: Duration,
    stream_response: bool,
) -> Reply {
    let service = subject.split('.').next().unwrap_or(subject);
    let settings = match resolve(parts, service, timeout).await {
        Ok(settings) => settings,
        Err(message) => return Reply::Transport(message),
    };
    let url = format!("{}{}", settings.base_url(), http_path(subject));
    let deadline = Instant::now() + timeout;

    let mut request = parts.http.post(&url);
    for (name, value) in baggage.to_headers() {
        request = request.header(name, value);
    }
    request = match payload {
        Payload::Json(value) => match serde_json::to_vec(&value) {
            Ok(body) => request.header(CONTENT_TYPE, content_type::JSON).body(body),
            Err(err) => return Reply::Transport(err.to_string()),
        },
        Payload::Stream(stream) => request
            .header(CONTENT_TYPE, content_type::OCTET_STREAM)
            .body(reqwest::Body::wrap_stream(stream)),
    };

    tracing::debug!(subject, url = %url, "sending over HTTP");
    let response = match timeout_at(deadline, request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => return Reply::Transport(format!("HTTP request to {url} failed: {err}")),
        Err(_) => return Reply::Transport(format!("HTTP request to {url} timed out")),
    };

    let status = response.status();
    if stream_response && status.is_success() {
        let body = response.bytes_stream().map_err(io::Error::other);
        return Reply::Stream(Box::pin(body));
    }

    match timeout_at(deadline, response.bytes()).await {
        Ok(Ok(body)) => match Envelope::decode(&body) {
            Ok(envelope) => Reply::Envelope(envelope),
            Err(err) => Reply::Transport(format!("HTTP {status} from {url}: {err}")),
        },
        Ok(Err(err)) => Reply::Transport(format!("reading response from {url} failed: {err}")),
        Err(_) => Reply::Transport(format!("reading response from {url} timed out")),
    }
}
