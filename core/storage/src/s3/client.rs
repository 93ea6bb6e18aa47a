//! S3 REST API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use stowage_common::cancel::run_cancellable;
use stowage_common::{
    ByteRange, ByteStream, CancellationToken, Error, Result, RetryConfig, RetryExecutor,
};

use super::service::S3Config;
use crate::http::{
    body_stream, build_client, handle_response, header_str, parse_http_date, parse_xml,
    read_text, read_xml, required_header, send, send_retrying, streaming_body, with_query,
};
use crate::sigv4::{encode_path, Signer, UNSIGNED_PAYLOAD};

/// One object from a listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectSummary {
    pub key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
}

/// A folder-like common prefix from a delimited listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonPrefix {
    pub prefix: String,
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListBucketResult {
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default)]
    pub contents: Vec<ObjectSummary>,
    #[serde(default)]
    pub common_prefixes: Vec<CommonPrefix>,
    #[serde(default)]
    pub next_continuation_token: Option<String>,
}

impl ListBucketResult {
    /// Continuation token for the next page, if there is one.
    pub fn next_page(&self) -> Option<String> {
        if self.is_truncated {
            self.next_continuation_token.clone()
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

/// A part recorded for `CompleteMultipartUpload`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompletedPart {
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: &'a [CompletedPart],
}

/// Metadata returned by `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Strip the quotes S3 puts around ETags.
pub fn clean_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// S3 REST API client bound to one bucket.
pub struct S3Client {
    http: Client,
    signer: Signer,
    base: Url,
    retry: RetryExecutor,
}

impl S3Client {
    /// Create a client for the configured bucket.
    ///
    /// Without a custom endpoint requests use virtual-hosted style URLs;
    /// with one (MinIO, other S3-compatible stores) they use path style.
    pub fn new(config: &S3Config) -> Result<Self> {
        let base = match &config.endpoint {
            Some(endpoint) => format!("{}/{}/", endpoint.trim_end_matches('/'), config.bucket),
            None => format!("https://{}.s3.{}.amazonaws.com/", config.bucket, config.region),
        };
        let base = Url::parse(&base)
            .map_err(|e| Error::InvalidInput(format!("Invalid S3 endpoint '{}': {}", base, e)))?;

        Ok(Self {
            http: build_client(Duration::from_secs(config.timeout_secs))?,
            signer: Signer::new(config.credentials.clone(), config.region.clone(), "s3"),
            base,
            retry: RetryExecutor::new(RetryConfig::new(config.max_retries)),
        })
    }

    /// Unsigned URL of an object.
    pub fn object_url(&self, key: &str) -> Result<Url> {
        self.base
            .join(&encode_path(key))
            .map_err(|e| Error::InvalidInput(format!("Invalid object key '{}': {}", key, e)))
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        mut headers: Vec<(String, String)>,
    ) -> Result<RequestBuilder> {
        headers.push(("x-amz-content-sha256".to_string(), UNSIGNED_PAYLOAD.to_string()));
        let signed = self
            .signer
            .sign(method.as_str(), &url, &headers, UNSIGNED_PAYLOAD, Utc::now())?;

        let mut request = self.http.request(method, url);
        for (name, value) in headers.iter().chain(signed.iter()) {
            request = request.header(name.as_str(), value.as_str());
        }
        Ok(request)
    }

    /// Fetch one page of a listing.
    ///
    /// With a `delimiter`, keys below the next delimiter are rolled up into
    /// common prefixes.
    pub async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        max_keys: Option<u32>,
        token: &CancellationToken,
    ) -> Result<ListBucketResult> {
        let max_keys = max_keys.map(|n| n.to_string());
        let mut query = vec![("list-type", "2"), ("prefix", prefix)];
        if let Some(delimiter) = delimiter {
            query.push(("delimiter", delimiter));
        }
        if let Some(continuation) = continuation {
            query.push(("continuation-token", continuation));
        }
        if let Some(max_keys) = &max_keys {
            query.push(("max-keys", max_keys));
        }
        let url = with_query(self.base.clone(), &query);

        let response = send_retrying(&self.retry, token, "ListObjectsV2", || {
            self.request(Method::GET, url.clone(), Vec::new())
        })
        .await?;
        read_xml(response, token, "ListObjectsV2").await
    }

    /// Object metadata.
    pub async fn head_object(&self, key: &str, token: &CancellationToken) -> Result<ObjectHead> {
        let url = self.object_url(key)?;
        let response = send_retrying(&self.retry, token, "HeadObject", || {
            self.request(Method::HEAD, url.clone(), Vec::new())
        })
        .await?;

        let size = header_str(&response, "content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(ObjectHead {
            size,
            modified: header_str(&response, "last-modified").and_then(|v| parse_http_date(&v)),
            etag: header_str(&response, "etag").map(|v| clean_etag(&v)),
        })
    }

    /// Upload an object in a single streaming request.
    pub async fn put_object(
        &self,
        key: &str,
        body: ByteStream,
        length: u64,
        token: &CancellationToken,
    ) -> Result<Option<String>> {
        let url = self.object_url(key)?;
        let request = self
            .request(Method::PUT, url, Vec::new())?
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(streaming_body(body));
        let response = send(request, token, "PutObject").await?;
        Ok(header_str(&response, "etag").map(|v| clean_etag(&v)))
    }

    /// Start a multipart upload and return its id.
    pub async fn create_multipart(&self, key: &str, token: &CancellationToken) -> Result<String> {
        let url = with_query(self.object_url(key)?, &[("uploads", "")]);
        let response = send_retrying(&self.retry, token, "CreateMultipartUpload", || {
            self.request(Method::POST, url.clone(), Vec::new())
        })
        .await?;
        let result: InitiateMultipartUploadResult =
            read_xml(response, token, "CreateMultipartUpload").await?;
        Ok(result.upload_id)
    }

    /// Upload one part and return its ETag.
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        token: &CancellationToken,
    ) -> Result<String> {
        let number = part_number.to_string();
        let url = with_query(
            self.object_url(key)?,
            &[("partNumber", &number), ("uploadId", upload_id)],
        );
        let response = send_retrying(&self.retry, token, "UploadPart", || {
            Ok(self
                .request(Method::PUT, url.clone(), Vec::new())?
                .header(reqwest::header::CONTENT_LENGTH, data.len())
                .body(data.clone()))
        })
        .await?;
        let etag = required_header(&response, "etag", "UploadPart")?;
        Ok(clean_etag(&etag))
    }

    /// Assemble the uploaded parts into the final object.
    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        token: &CancellationToken,
    ) -> Result<()> {
        let url = with_query(self.object_url(key)?, &[("uploadId", upload_id)]);
        let body = quick_xml::se::to_string(&CompleteMultipartUpload { parts })
            .map_err(|e| Error::Serialization(format!("Failed to encode part list: {}", e)))?;

        let response = send_retrying(&self.retry, token, "CompleteMultipartUpload", || {
            Ok(self
                .request(Method::POST, url.clone(), Vec::new())?
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(body.clone()))
        })
        .await?;

        // Failures can arrive with a 200 status and an <Error> document.
        let text = read_text(response, token, "CompleteMultipartUpload").await?;
        if text.contains("<Error>") {
            let error: S3ErrorBody = parse_xml(&text, "CompleteMultipartUpload")?;
            return Err(Error::Network(format!(
                "CompleteMultipartUpload failed: {} - {}",
                error.code, error.message
            )));
        }
        Ok(())
    }

    /// Abandon a multipart upload and free its parts.
    pub async fn abort_multipart(
        &self,
        key: &str,
        upload_id: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let url = with_query(self.object_url(key)?, &[("uploadId", upload_id)]);
        send_retrying(&self.retry, token, "AbortMultipartUpload", || {
            self.request(Method::DELETE, url.clone(), Vec::new())
        })
        .await?;
        Ok(())
    }

    /// Stream an object, optionally a byte range of it.
    pub async fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<ByteStream> {
        let url = self.object_url(key)?;
        let headers: Vec<(String, String)> = range
            .map(|r| vec![("range".to_string(), r.to_header())])
            .unwrap_or_default();
        let response = send_retrying(&self.retry, token, "GetObject", || {
            self.request(Method::GET, url.clone(), headers.clone())
        })
        .await?;
        Ok(body_stream(response))
    }

    /// Delete an object.
    pub async fn delete_object(&self, key: &str, token: &CancellationToken) -> Result<()> {
        let url = self.object_url(key)?;
        send_retrying(&self.retry, token, "DeleteObject", || {
            self.request(Method::DELETE, url.clone(), Vec::new())
        })
        .await?;
        Ok(())
    }

    /// Replace an object's ACL with a canned one (`private`, `public-read`).
    pub async fn put_acl(&self, key: &str, acl: &str, token: &CancellationToken) -> Result<()> {
        let url = with_query(self.object_url(key)?, &[("acl", "")]);
        let headers = vec![("x-amz-acl".to_string(), acl.to_string())];
        send_retrying(&self.retry, token, "PutObjectAcl", || {
            self.request(Method::PUT, url.clone(), headers.clone())
        })
        .await?;
        Ok(())
    }

    /// Whether an unauthenticated request can read the object.
    pub async fn is_publicly_readable(&self, key: &str, token: &CancellationToken) -> Result<bool> {
        let url = self.object_url(key)?;
        let response = run_cancellable(token, async {
            self.http
                .head(url)
                .send()
                .await
                .map_err(|e| Error::Network(format!("Anonymous HeadObject failed: {}", e)))
        })
        .await?;
        if matches!(response.status(), StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) {
            return Ok(false);
        }
        handle_response(response, "Anonymous HeadObject").await?;
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct S3ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}
