//! Azure Blob Storage REST client.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use stowage_common::{
    ByteRange, ByteStream, CancellationToken, Error, Result, RetryConfig, RetryExecutor,
};

use super::auth::{SharedKey, API_VERSION};
use crate::http::{
    body_stream, build_client, format_http_date, header_str, parse_http_date, read_xml, send,
    send_retrying, streaming_body, with_query,
};
use crate::sigv4::encode_path;

/// Properties of a listed blob.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobProperties {
    #[serde(rename = "Content-Length", default)]
    pub content_length: u64,
    #[serde(rename = "Last-Modified", default)]
    pub last_modified: Option<String>,
    #[serde(rename = "Etag", default)]
    pub etag: Option<String>,
}

impl BlobProperties {
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified.as_deref().and_then(parse_http_date)
    }
}

/// One blob from a listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlobItem {
    pub name: String,
    pub properties: BlobProperties,
}

/// A virtual directory from a delimited listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlobPrefix {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Blobs {
    #[serde(rename = "Blob", default)]
    pub blobs: Vec<BlobItem>,
    #[serde(rename = "BlobPrefix", default)]
    pub prefixes: Vec<BlobPrefix>,
}

/// One page of a List Blobs response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnumerationResults {
    #[serde(default)]
    pub blobs: Blobs,
    #[serde(default)]
    pub next_marker: Option<String>,
}

impl EnumerationResults {
    /// Marker of the next page, if there is one.
    pub fn next_page(&self) -> Option<String> {
        self.next_marker.clone().filter(|m| !m.is_empty())
    }
}

/// Metadata returned by Get Blob Properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHead {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Block id for the `index`-th block of an upload.
///
/// Ids within a blob must all have the same length.
pub fn block_id(index: u32) -> String {
    STANDARD.encode(format!("block-{:08}", index))
}

/// Body of a Put Block List request committing `ids` in order.
pub fn block_list_xml(ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Azure Blob client bound to one container.
pub struct AzureClient {
    http: Client,
    key: SharedKey,
    container: String,
    container_url: Url,
    retry: RetryExecutor,
}

impl AzureClient {
    /// Create a client for a container.
    ///
    /// Without an endpoint the public cloud URL of the account is used;
    /// emulators such as Azurite pass theirs, including the account path.
    pub fn new(
        key: SharedKey,
        container: &str,
        endpoint: Option<&str>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let base = match endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", key.account()),
        };
        let container_url = Url::parse(&format!("{}/{}", base, encode_path(container)))
            .map_err(|e| Error::InvalidInput(format!("Invalid Azure endpoint: {}", e)))?;

        Ok(Self {
            http: build_client(timeout)?,
            key,
            container: container.to_string(),
            container_url,
            retry: RetryExecutor::new(RetryConfig::new(max_retries)),
        })
    }

    /// Unsigned URL of a blob.
    pub fn blob_url(&self, name: &str) -> Result<Url> {
        Url::parse(&format!("{}/{}", self.container_url, encode_path(name)))
            .map_err(|e| Error::InvalidInput(format!("Invalid blob name '{}': {}", name, e)))
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        mut headers: Vec<(String, String)>,
    ) -> Result<RequestBuilder> {
        headers.push(("x-ms-date".to_string(), format_http_date(Utc::now())));
        headers.push(("x-ms-version".to_string(), API_VERSION.to_string()));
        let authorization = self.key.authorization(method.as_str(), &url, &headers)?;

        let mut request = self.http.request(method, url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        Ok(request.header(reqwest::header::AUTHORIZATION, authorization))
    }

    /// Fetch one page of a listing.
    pub async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_results: Option<u32>,
        token: &CancellationToken,
    ) -> Result<EnumerationResults> {
        let max_results = max_results.map(|n| n.to_string());
        let mut query = vec![("restype", "container"), ("comp", "list"), ("prefix", prefix)];
        if let Some(delimiter) = delimiter {
            query.push(("delimiter", delimiter));
        }
        if let Some(marker) = marker {
            query.push(("marker", marker));
        }
        if let Some(max_results) = &max_results {
            query.push(("maxresults", max_results));
        }
        let url = with_query(self.container_url.clone(), &query);

        let response = send_retrying(&self.retry, token, "List Blobs", || {
            self.request(Method::GET, url.clone(), Vec::new())
        })
        .await?;
        read_xml(response, token, "List Blobs").await
    }

    /// Size and timestamps of a blob.
    pub async fn get_properties(&self, name: &str, token: &CancellationToken) -> Result<BlobHead> {
        let url = self.blob_url(name)?;
        let response = send_retrying(&self.retry, token, "Get Blob Properties", || {
            self.request(Method::HEAD, url.clone(), Vec::new())
        })
        .await?;

        let size = header_str(&response, "content-length")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                Error::Serialization("Get Blob Properties lacks Content-Length".to_string())
            })?;
        Ok(BlobHead {
            size,
            modified: header_str(&response, "last-modified")
                .as_deref()
                .and_then(parse_http_date),
            etag: header_str(&response, "etag"),
        })
    }

    /// Upload a whole blob in one request.
    pub async fn put_blob(
        &self,
        name: &str,
        body: ByteStream,
        length: u64,
        token: &CancellationToken,
    ) -> Result<()> {
        let url = self.blob_url(name)?;
        let headers = vec![
            ("x-ms-blob-type".to_string(), "BlockBlob".to_string()),
            ("content-length".to_string(), length.to_string()),
        ];
        // A consumed stream cannot be replayed, so this is not retried.
        let request = self
            .request(Method::PUT, url, headers)?
            .body(streaming_body(body));
        send(request, token, "Put Blob").await?;
        Ok(())
    }

    /// Stage one block of a block blob.
    pub async fn put_block(
        &self,
        name: &str,
        block_id: &str,
        data: Bytes,
        token: &CancellationToken,
    ) -> Result<()> {
        let url = with_query(
            self.blob_url(name)?,
            &[("comp", "block"), ("blockid", block_id)],
        );
        let headers = vec![("content-length".to_string(), data.len().to_string())];
        send_retrying(&self.retry, token, "Put Block", || {
            Ok(self
                .request(Method::PUT, url.clone(), headers.clone())?
                .body(data.clone()))
        })
        .await?;
        Ok(())
    }

    /// Commit staged blocks in order.
    pub async fn put_block_list(
        &self,
        name: &str,
        block_ids: &[String],
        token: &CancellationToken,
    ) -> Result<()> {
        let url = with_query(self.blob_url(name)?, &[("comp", "blocklist")]);
        let body = Bytes::from(block_list_xml(block_ids));
        let headers = vec![
            ("content-length".to_string(), body.len().to_string()),
            ("content-type".to_string(), "application/xml".to_string()),
        ];
        send_retrying(&self.retry, token, "Put Block List", || {
            Ok(self
                .request(Method::PUT, url.clone(), headers.clone())?
                .body(body.clone()))
        })
        .await?;
        Ok(())
    }

    /// Download a blob, or a range of it.
    pub async fn get_blob(
        &self,
        name: &str,
        range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<ByteStream> {
        let url = self.blob_url(name)?;
        let headers: Vec<(String, String)> = range
            .map(|r| vec![("x-ms-range".to_string(), r.to_header())])
            .unwrap_or_default();
        let response = send_retrying(&self.retry, token, "Get Blob", || {
            self.request(Method::GET, url.clone(), headers.clone())
        })
        .await?;
        Ok(body_stream(response))
    }

    /// Delete a blob.
    pub async fn delete_blob(&self, name: &str, token: &CancellationToken) -> Result<()> {
        let url = self.blob_url(name)?;
        send_retrying(&self.retry, token, "Delete Blob", || {
            self.request(Method::DELETE, url.clone(), Vec::new())
        })
        .await?;
        Ok(())
    }

    /// Blob URL carrying a read-only SAS valid until `expiry`.
    pub fn sas_url(&self, name: &str, expiry: DateTime<Utc>) -> Result<String> {
        let mut url = self.blob_url(name)?;
        let sas = self.key.blob_read_sas(&self.container, name, expiry)?;
        url.set_query(Some(&sas));
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse_xml;

    fn client(endpoint: Option<&str>) -> AzureClient {
        let key = SharedKey::new("acct", "c3Rvd2FnZS10ZXN0LWtleQ==").unwrap();
        AzureClient::new(key, "backups", endpoint, Duration::from_secs(5), 1).unwrap()
    }

    #[test]
    fn test_blob_urls() {
        let public = client(None);
        assert_eq!(
            public.blob_url("dir/my file.txt").unwrap().as_str(),
            "https://acct.blob.core.windows.net/backups/dir/my%20file.txt"
        );

        let local = client(Some("http://127.0.0.1:10000/acct/"));
        assert_eq!(
            local.blob_url("a.bin").unwrap().as_str(),
            "http://127.0.0.1:10000/acct/backups/a.bin"
        );
    }

    #[test]
    fn test_parse_enumeration_results() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
            <EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="backups">
              <Prefix>dir/</Prefix>
              <Delimiter>/</Delimiter>
              <Blobs>
                <Blob>
                  <Name>dir/a.txt</Name>
                  <Properties>
                    <Last-Modified>Fri, 01 Mar 2024 12:00:00 GMT</Last-Modified>
                    <Etag>0x8CBFF45D8A29A19</Etag>
                    <Content-Length>42</Content-Length>
                    <BlobType>BlockBlob</BlobType>
                  </Properties>
                </Blob>
                <BlobPrefix><Name>dir/sub/</Name></BlobPrefix>
                <Blob>
                  <Name>dir/b.txt</Name>
                  <Properties><Content-Length>7</Content-Length></Properties>
                </Blob>
              </Blobs>
              <NextMarker>2!dir/c</NextMarker>
            </EnumerationResults>"#;
        let page: EnumerationResults = parse_xml(xml, "List Blobs").unwrap();
        assert_eq!(page.blobs.blobs.len(), 2);
        assert_eq!(page.blobs.blobs[0].properties.content_length, 42);
        assert!(page.blobs.blobs[0].properties.modified().is_some());
        assert_eq!(page.blobs.prefixes[0].name, "dir/sub/");
        assert_eq!(page.next_page().as_deref(), Some("2!dir/c"));
    }

    #[test]
    fn test_empty_page_has_no_next() {
        let xml = r#"<EnumerationResults><Blobs /><NextMarker /></EnumerationResults>"#;
        let page: EnumerationResults = parse_xml(xml, "List Blobs").unwrap();
        assert!(page.blobs.blobs.is_empty());
        assert_eq!(page.next_page(), None);
    }

    #[test]
    fn test_block_ids_have_equal_length() {
        assert_eq!(block_id(0).len(), block_id(99_999).len());
        assert_ne!(block_id(1), block_id(2));
        let xml = block_list_xml(&[block_id(0), block_id(1)]);
        assert!(xml.ends_with("</Latest></BlockList>"));
        assert_eq!(xml.matches("<Latest>").count(), 2);
    }

    #[test]
    fn test_sas_url() {
        let expiry = Utc::now() + chrono::Duration::hours(1);
        let url = client(None).sas_url("dir/a.txt", expiry).unwrap();
        let blob = "https://acct.blob.core.windows.net/backups/dir/a.txt";
        assert!(url.starts_with(&format!("{}?sv={}", blob, API_VERSION)));
        assert!(url.contains("&sp=r&sig="));
    }
}
