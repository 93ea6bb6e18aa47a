//! Glacier vault operations used by the service.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use stowage_common::{ByteRange, ByteStream, CancellationToken, Result};

/// Job status reported by `DescribeJob`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// `DescribeJob` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobDescription {
    pub job_id: String,
    pub status_code: JobStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

/// What a job retrieves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    /// JSON list of every archive in the vault.
    Inventory,
    /// Content of one archive.
    ArchiveRetrieval { archive_id: String },
}

/// Vault-level Glacier operations.
///
/// [`GlacierClient`](super::GlacierClient) talks to AWS;
/// [`MemoryGlacier`](super::MemoryGlacier) implements the same calls in
/// memory for tests.
#[async_trait]
pub trait GlacierApi: Send + Sync {
    /// Start a job and return its id.
    async fn initiate_job(&self, request: &JobRequest, token: &CancellationToken)
        -> Result<String>;

    /// Current state of a job.
    async fn describe_job(&self, job_id: &str, token: &CancellationToken)
        -> Result<JobDescription>;

    /// Output of a succeeded job, optionally a byte range of it.
    async fn get_job_output(
        &self,
        job_id: &str,
        range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<ByteStream>;

    /// Start a multipart archive upload and return its id.
    async fn initiate_multipart_upload(
        &self,
        description: &str,
        part_size: u64,
        token: &CancellationToken,
    ) -> Result<String>;

    /// Upload the part starting at `offset` with its tree hash (hex).
    async fn upload_part(
        &self,
        upload_id: &str,
        offset: u64,
        data: Bytes,
        tree_hash: &str,
        token: &CancellationToken,
    ) -> Result<()>;

    /// Finish an upload and return the new archive id.
    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        archive_size: u64,
        tree_hash: &str,
        token: &CancellationToken,
    ) -> Result<String>;

    /// Abandon an upload.
    async fn abort_multipart_upload(&self, upload_id: &str, token: &CancellationToken)
        -> Result<()>;

    /// Delete one archive.
    async fn delete_archive(&self, archive_id: &str, token: &CancellationToken) -> Result<()>;
}
