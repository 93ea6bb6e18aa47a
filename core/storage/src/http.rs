//! reqwest plumbing shared by the REST-backed services.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use stowage_common::cancel::run_cancellable;
use stowage_common::{ByteStream, CancellationToken, Error, Result, RetryExecutor};

use crate::sigv4::uri_encode;

/// Build an HTTP client with the crate user agent.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(concat!("Stowage/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Send a request, racing it against the token, and check the status.
pub(crate) async fn send(
    request: RequestBuilder,
    token: &CancellationToken,
    what: &str,
) -> Result<Response> {
    let response = run_cancellable(token, async {
        request
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} failed: {}", what, e)))
    })
    .await?;
    handle_response(response, what).await
}

/// Send an idempotent request, rebuilding and retrying it on transient
/// failures.
pub(crate) async fn send_retrying<F>(
    retry: &RetryExecutor,
    token: &CancellationToken,
    what: &str,
    build: F,
) -> Result<Response>
where
    F: Fn() -> Result<RequestBuilder>,
{
    retry
        .execute(token, || {
            let request = build();
            async move { send(request?, token, what).await }
        })
        .await
}

/// Map an error status onto the unified error taxonomy.
pub(crate) async fn handle_response(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("{} returned {}", what, status)
    } else {
        format!("{} returned {}: {}", what, status, body.trim())
    };

    Err(match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::UNAUTHORIZED => Error::Authentication(message),
        StatusCode::FORBIDDEN => Error::PermissionDenied(message),
        StatusCode::CONFLICT => Error::AlreadyExists(message),
        StatusCode::BAD_REQUEST | StatusCode::RANGE_NOT_SATISFIABLE => {
            Error::InvalidInput(message)
        }
        StatusCode::TOO_MANY_REQUESTS => Error::Transient(message),
        s if s.is_server_error() => Error::Transient(message),
        _ => Error::Network(message),
    })
}

/// Read a JSON response body.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: Response,
    token: &CancellationToken,
    what: &str,
) -> Result<T> {
    let text = read_text(response, token, what).await?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Serialization(format!("Failed to parse {} response: {}", what, e)))
}

/// Read an XML response body.
pub(crate) async fn read_xml<T: DeserializeOwned>(
    response: Response,
    token: &CancellationToken,
    what: &str,
) -> Result<T> {
    let text = read_text(response, token, what).await?;
    parse_xml(&text, what)
}

/// Parse an XML document.
pub(crate) fn parse_xml<T: DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    quick_xml::de::from_str(text)
        .map_err(|e| Error::Serialization(format!("Failed to parse {} response: {}", what, e)))
}

/// Read a response body as text.
pub(crate) async fn read_text(
    response: Response,
    token: &CancellationToken,
    what: &str,
) -> Result<String> {
    run_cancellable(token, async {
        response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read {} response: {}", what, e)))
    })
    .await
}

/// Response body as a byte stream.
pub(crate) fn body_stream(response: Response) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Network(format!("Download interrupted: {}", e)))),
    )
}

/// Request body fed from a byte stream.
pub(crate) fn streaming_body(stream: ByteStream) -> Body {
    Body::wrap_stream(stream)
}

/// Append query parameters, percent-encoded the way SigV4 canonicalizes
/// them (spaces as `%20`, never `+`).
pub(crate) fn with_query(mut url: Url, pairs: &[(&str, &str)]) -> Url {
    if pairs.is_empty() {
        return url;
    }
    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    url.set_query(Some(&query));
    url
}

/// Header value as a string, if present and valid.
pub(crate) fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Required header value.
pub(crate) fn required_header(response: &Response, name: &str, what: &str) -> Result<String> {
    header_str(response, name).ok_or_else(|| {
        Error::Serialization(format!("{} response lacks the '{}' header", what, name))
    })
}

/// Parse an RFC 1123 HTTP date.
pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Format a timestamp as an RFC 1123 HTTP date.
pub(crate) fn format_http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
