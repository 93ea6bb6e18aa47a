//! Local HTTP fakes for exercising the REST-backed services.

use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use std::collections::HashMap;
use tokio::net::TcpListener;

use stowage_common::ByteRange;

/// Serve the router built by `app` on an ephemeral local port.
///
/// `app` receives the base URL so fakes can hand out absolute links.
/// Returns the same base URL.
pub(crate) async fn serve<F>(app: F) -> String
where
    F: FnOnce(&str) -> Router,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let router = app(&base);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    base
}

/// Decoded query parameters.
pub(crate) fn query(uri: &Uri) -> HashMap<String, String> {
    url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

/// Decoded request path without the leading `/`.
pub(crate) fn path(uri: &Uri) -> String {
    percent_decode_str(uri.path().trim_start_matches('/'))
        .decode_utf8_lossy()
        .into_owned()
}

/// Inclusive range from a `bytes=start-[end]` header.
pub(crate) fn range(headers: &HeaderMap, name: &str) -> Option<ByteRange> {
    let value = headers.get(name)?.to_str().ok()?;
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    ByteRange::new(start.parse().ok()?, end).ok()
}

/// Body bytes selected by an optional range, with the matching status.
pub(crate) fn ranged(data: &[u8], range: Option<ByteRange>) -> (StatusCode, Vec<u8>) {
    match range {
        Some(range) => match range.resolve(data.len() as u64) {
            Ok((start, end)) => (
                StatusCode::PARTIAL_CONTENT,
                data[start as usize..=end as usize].to_vec(),
            ),
            Err(_) => (StatusCode::RANGE_NOT_SATISFIABLE, Vec::new()),
        },
        None => (StatusCode::OK, data.to_vec()),
    }
}

pub(crate) fn json(status: StatusCode, value: Value) -> Response {
    (status, Json(value)).into_response()
}

pub(crate) fn xml(status: StatusCode, body: String) -> Response {
    (status, [("content-type", "application/xml")], body).into_response()
}

/// Escape text for an XML element.
pub(crate) fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
