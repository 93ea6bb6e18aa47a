//! Yandex Disk REST API client.

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use stowage_common::{
    ByteRange, ByteStream, CancellationToken, Error, Result, RetryConfig, RetryExecutor,
};

use crate::http::{
    body_stream, build_client, read_json, send, send_retrying, streaming_body, with_query,
};

/// Production API root.
pub const DEFAULT_API_URL: &str = "https://cloud-api.yandex.net/v1/disk";

/// Resource type reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Dir,
    File,
}

/// A file or folder on the disk.
#[derive(Debug, Clone, Deserialize)]
pub struct Resource {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ResourceType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(rename = "_embedded", default)]
    pub embedded: Option<ResourceList>,
}

/// Children of a folder, one page at a time.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceList {
    #[serde(default)]
    pub items: Vec<Resource>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub total: u64,
}

impl ResourceList {
    /// Offset of the next page, if there is one.
    pub fn next_offset(&self) -> Option<u64> {
        let next = self.offset + self.items.len() as u64;
        (!self.items.is_empty() && next < self.total).then_some(next)
    }
}

/// Hypermedia link returned by most mutating calls.
#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default)]
    pub method: Option<String>,
}

/// State of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Success,
    Failed,
    InProgress,
}

#[derive(Debug, Deserialize)]
struct Operation {
    status: OperationStatus,
}

/// Disk path in API notation.
pub fn disk_path(path: &str) -> String {
    format!("disk:/{}", path)
}

/// Refine a status-mapped error with the API's error code.
///
/// The API answers 409 both for existing resources and for missing
/// parents; the latter is reported as `NotFound`.
fn refine(err: Error) -> Error {
    match err {
        Error::AlreadyExists(message) if message.contains("DiskPathDoesntExistsError") => {
            Error::NotFound(message)
        }
        other => other,
    }
}

/// Yandex Disk API client authenticated with an OAuth token.
pub struct YandexClient {
    http: Client,
    api_url: String,
    oauth_token: String,
    retry: RetryExecutor,
}

impl YandexClient {
    pub fn new(
        oauth_token: String,
        api_url: Option<&str>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let api_url = api_url.unwrap_or(DEFAULT_API_URL).trim_end_matches('/');
        Url::parse(api_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid Yandex API URL: {}", e)))?;
        Ok(Self {
            http: build_client(timeout)?,
            api_url: api_url.to_string(),
            oauth_token,
            retry: RetryExecutor::new(RetryConfig::new(max_retries)),
        })
    }

    pub(crate) fn endpoint(&self, route: &str, query: &[(&str, &str)]) -> Result<Url> {
        let url = Url::parse(&format!("{}{}", self.api_url, route))
            .map_err(|e| Error::InvalidInput(format!("Invalid Yandex URL: {}", e)))?;
        Ok(with_query(url, query))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("OAuth {}", self.oauth_token),
            )
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        token: &CancellationToken,
        what: &str,
    ) -> Result<reqwest::Response> {
        send_retrying(&self.retry, token, what, || {
            Ok(self.request(method.clone(), url.clone()))
        })
        .await
        .map_err(refine)
    }

    /// Metadata of a resource; folders include a page of children.
    pub async fn resource(
        &self,
        path: &str,
        limit: u64,
        offset: u64,
        token: &CancellationToken,
    ) -> Result<Resource> {
        let path = disk_path(path);
        let limit = limit.to_string();
        let offset = offset.to_string();
        let url = self.endpoint(
            "/resources",
            &[
                ("path", path.as_str()),
                ("limit", limit.as_str()),
                ("offset", offset.as_str()),
            ],
        )?;
        let response = self.call(Method::GET, url, token, "Get resource").await?;
        read_json(response, token, "Get resource").await
    }

    /// Create a folder.
    ///
    /// # Errors
    /// - `AlreadyExists` if something already exists at `path`
    /// - `NotFound` if the parent folder is missing
    pub async fn create_folder(&self, path: &str, token: &CancellationToken) -> Result<()> {
        let url = self.endpoint("/resources", &[("path", disk_path(path).as_str())])?;
        // Not retried: a lost response would turn success into AlreadyExists.
        send(self.request(Method::PUT, url), token, "Create folder")
            .await
            .map_err(refine)?;
        Ok(())
    }

    /// Link to upload a file to.
    pub async fn upload_link(&self, path: &str, token: &CancellationToken) -> Result<Link> {
        let url = self.endpoint(
            "/resources/upload",
            &[("path", disk_path(path).as_str()), ("overwrite", "true")],
        )?;
        let response = self.call(Method::GET, url, token, "Get upload link").await?;
        read_json(response, token, "Get upload link").await
    }

    /// Stream a file body to an upload link.
    pub async fn upload_to(
        &self,
        href: &str,
        body: ByteStream,
        length: u64,
        token: &CancellationToken,
    ) -> Result<()> {
        let request = self
            .http
            .put(href)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(streaming_body(body));
        send(request, token, "Upload").await?;
        Ok(())
    }

    /// Link to download a file from.
    pub async fn download_link(&self, path: &str, token: &CancellationToken) -> Result<Link> {
        let url = self.endpoint("/resources/download", &[("path", disk_path(path).as_str())])?;
        let response = self.call(Method::GET, url, token, "Get download link").await?;
        read_json(response, token, "Get download link").await
    }

    /// Stream a file from a download link.
    pub async fn download_from(
        &self,
        href: &str,
        range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<ByteStream> {
        let mut request = self.http.get(href);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.to_header());
        }
        let response = send(request, token, "Download").await?;
        if range.is_some() && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::NotSupported(
                "Download server ignored the requested range".to_string(),
            ));
        }
        Ok(body_stream(response))
    }

    /// Delete a resource permanently.
    ///
    /// Returns the operation to poll when the API finishes asynchronously.
    pub async fn delete(&self, path: &str, token: &CancellationToken) -> Result<Option<Link>> {
        let url = self.endpoint(
            "/resources",
            &[("path", disk_path(path).as_str()), ("permanently", "true")],
        )?;
        let response = self.call(Method::DELETE, url, token, "Delete").await?;
        if response.status() == StatusCode::ACCEPTED {
            return read_json(response, token, "Delete").await.map(Some);
        }
        Ok(None)
    }

    /// Status of an asynchronous operation.
    pub async fn operation_status(
        &self,
        href: &str,
        token: &CancellationToken,
    ) -> Result<OperationStatus> {
        let url = Url::parse(href)
            .map_err(|e| Error::Serialization(format!("Invalid operation link: {}", e)))?;
        let response = self.call(Method::GET, url, token, "Get operation").await?;
        let operation: Operation = read_json(response, token, "Get operation").await?;
        Ok(operation.status)
    }

    /// Request publication of a resource.
    pub async fn publish(&self, path: &str, token: &CancellationToken) -> Result<()> {
        let url = self.endpoint("/resources/publish", &[("path", disk_path(path).as_str())])?;
        self.call(Method::PUT, url, token, "Publish").await?;
        Ok(())
    }

    /// Request unpublication of a resource.
    pub async fn unpublish(&self, path: &str, token: &CancellationToken) -> Result<()> {
        let url = self.endpoint("/resources/unpublish", &[("path", disk_path(path).as_str())])?;
        self.call(Method::PUT, url, token, "Unpublish").await?;
        Ok(())
    }

    /// Metadata of a public resource, as an anonymous visitor sees it.
    ///
    /// # Errors
    /// - `NotFound` once the resource is no longer public
    pub async fn public_resource(
        &self,
        public_key: &str,
        token: &CancellationToken,
    ) -> Result<Resource> {
        let url = self.endpoint("/public/resources", &[("public_key", public_key)])?;
        let request = self.http.get(url).header(reqwest::header::ACCEPT, "application/json");
        let response = send(request, token, "Get public resource").await?;
        read_json(response, token, "Get public resource").await
    }
}
