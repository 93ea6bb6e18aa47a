//! HTTP transport for the MEGA API.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use stowage_common::{ByteStream, Error, Result};

/// Default API endpoint.
pub const DEFAULT_API_URL: &str = "https://g.api.mega.co.nz";

/// Raw request channel to a MEGA API server and its transfer hosts.
///
/// [`HttpTransport`] talks to the real service; the in-memory server
/// implements the same trait for tests.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// POST a batch of commands and return the decoded JSON response.
    async fn post_commands(&self, seq: u64, sid: Option<&str>, body: Value) -> Result<Value>;

    /// POST one encrypted upload chunk to `url` and return the response body.
    async fn post_chunk(&self, url: &str, data: Bytes) -> Result<String>;

    /// GET a download URL as a byte stream.
    async fn get_stream(&self, url: &str) -> Result<ByteStream>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    http: Client,
    api_url: String,
}

impl HttpTransport {
    /// Create a transport for `api_url` (usually [`DEFAULT_API_URL`]).
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("Stowage/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn check_status(status: StatusCode, what: &str) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(Error::Transient(format!("{} returned {}", what, status)))
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound(format!("{} returned {}", what, status)))
        } else if status == StatusCode::FORBIDDEN {
            Err(Error::PermissionDenied(format!("{} returned {}", what, status)))
        } else {
            Err(Error::Network(format!("{} returned {}", what, status)))
        }
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn post_commands(&self, seq: u64, sid: Option<&str>, body: Value) -> Result<Value> {
        let url = format!("{}/cs", self.api_url);
        let mut query = vec![("id", seq.to_string())];
        if let Some(sid) = sid {
            query.push(("sid", sid.to_string()));
        }

        let response = self
            .http
            .post(&url)
            .query(&query)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("API request failed: {}", e)))?;
        Self::check_status(response.status(), "API request")?;

        response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse API response: {}", e)))
    }

    async fn post_chunk(&self, url: &str, data: Bytes) -> Result<String> {
        debug!("Uploading chunk of {} bytes", data.len());
        let response = self
            .http
            .post(url)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Chunk upload failed: {}", e)))?;
        Self::check_status(response.status(), "Chunk upload")?;

        response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read upload response: {}", e)))
    }

    async fn get_stream(&self, url: &str) -> Result<ByteStream> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Download request failed: {}", e)))?;
        Self::check_status(response.status(), "Download")?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Network(format!("Download interrupted: {}", e))));
        Ok(Box::pin(stream))
    }
}
