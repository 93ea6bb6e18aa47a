//! In-memory Glacier vault for testing.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use stowage_common::cancel::ensure_active;
use stowage_common::{ByteRange, ByteStream, CancellationToken, Error, Result};

use super::api::{GlacierApi, JobDescription, JobRequest, JobStatus};
use super::inventory::{ArchiveRecord, Inventory};
use super::tree_hash::tree_hash_hex;

const VAULT_ARN: &str = "arn:aws:glacier:memory:000000000000:vaults/memory";

struct Archive {
    description: String,
    data: Bytes,
    created: DateTime<Utc>,
}

struct Upload {
    description: String,
    part_size: u64,
    parts: HashMap<u64, Bytes>,
}

enum JobOutput {
    Inventory(Bytes),
    Archive(Bytes),
    Failed(String),
}

struct MemoryJob {
    polls_left: u32,
    output: JobOutput,
}

#[derive(Default)]
struct State {
    next_id: u64,
    archives: HashMap<String, Archive>,
    uploads: HashMap<String, Upload>,
    jobs: HashMap<String, MemoryJob>,
    job_delay: u32,
    fail_jobs: Option<String>,
    inventory_jobs: usize,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06}", prefix, self.next_id)
    }

    fn inventory(&self) -> Result<Bytes> {
        let mut archive_list: Vec<ArchiveRecord> = self
            .archives
            .iter()
            .map(|(id, archive)| ArchiveRecord {
                archive_id: id.clone(),
                archive_description: archive.description.clone(),
                creation_date: archive.created,
                size: archive.data.len() as u64,
                sha256_tree_hash: tree_hash_hex(&archive.data),
            })
            .collect();
        archive_list.sort_by(|a, b| a.archive_id.cmp(&b.archive_id));
        let inventory = Inventory {
            vault_arn: VAULT_ARN.to_string(),
            inventory_date: Utc::now(),
            archive_list,
        };
        Ok(Bytes::from(serde_json::to_vec(&inventory)?))
    }
}

/// Glacier vault kept in memory.
///
/// Jobs complete after a configurable number of `DescribeJob` calls. An
/// inventory job snapshots the vault when it is initiated, like the real
/// service's day-old inventories.
#[derive(Default)]
pub struct MemoryGlacier {
    state: Mutex<State>,
}

impl MemoryGlacier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `DescribeJob` calls that report a new job as in progress.
    pub fn set_job_delay(&self, polls: u32) {
        self.lock().job_delay = polls;
    }

    /// Make every job initiated from now on fail with `message`.
    pub fn fail_jobs(&self, message: Option<&str>) {
        self.lock().fail_jobs = message.map(str::to_string);
    }

    /// Store an archive directly and return its id.
    pub fn insert_archive(
        &self,
        description: &str,
        data: impl Into<Bytes>,
        created: DateTime<Utc>,
    ) -> String {
        let mut state = self.lock();
        let id = state.next_id("archive");
        state.archives.insert(
            id.clone(),
            Archive {
                description: description.to_string(),
                data: data.into(),
                created,
            },
        );
        id
    }

    /// Number of archives in the vault.
    pub fn archive_count(&self) -> usize {
        self.lock().archives.len()
    }

    /// Number of inventory jobs initiated so far.
    pub fn inventory_job_count(&self) -> usize {
        self.lock().inventory_jobs
    }

    /// Content of an archive, if it exists.
    pub fn archive_data(&self, archive_id: &str) -> Option<Bytes> {
        self.lock().archives.get(archive_id).map(|a| a.data.clone())
    }
}

#[async_trait]
impl GlacierApi for MemoryGlacier {
    async fn initiate_job(
        &self,
        request: &JobRequest,
        token: &CancellationToken,
    ) -> Result<String> {
        ensure_active(token)?;
        let mut state = self.lock();
        let output = match (&state.fail_jobs, request) {
            (Some(message), _) => JobOutput::Failed(message.clone()),
            (None, JobRequest::Inventory) => JobOutput::Inventory(state.inventory()?),
            (None, JobRequest::ArchiveRetrieval { archive_id }) => {
                let archive = state.archives.get(archive_id).ok_or_else(|| {
                    Error::NotFound(format!("Archive {} does not exist", archive_id))
                })?;
                JobOutput::Archive(archive.data.clone())
            }
        };
        if *request == JobRequest::Inventory {
            state.inventory_jobs += 1;
        }

        let id = state.next_id("job");
        let polls_left = state.job_delay;
        state.jobs.insert(id.clone(), MemoryJob { polls_left, output });
        Ok(id)
    }

    async fn describe_job(
        &self,
        job_id: &str,
        token: &CancellationToken,
    ) -> Result<JobDescription> {
        ensure_active(token)?;
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {} does not exist", job_id)))?;

        let (status_code, status_message) = if job.polls_left > 0 {
            job.polls_left -= 1;
            (JobStatus::InProgress, None)
        } else {
            match &job.output {
                JobOutput::Failed(message) => (JobStatus::Failed, Some(message.clone())),
                _ => (JobStatus::Succeeded, Some("Succeeded".to_string())),
            }
        };
        Ok(JobDescription {
            job_id: job_id.to_string(),
            status_code,
            status_message,
            completed: status_code != JobStatus::InProgress,
        })
    }

    async fn get_job_output(
        &self,
        job_id: &str,
        range: Option<ByteRange>,
        token: &CancellationToken,
    ) -> Result<ByteStream> {
        ensure_active(token)?;
        let state = self.lock();
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {} does not exist", job_id)))?;
        if job.polls_left > 0 {
            return Err(Error::InvalidState(format!("Job {} is not complete", job_id)));
        }
        let data = match &job.output {
            JobOutput::Inventory(data) | JobOutput::Archive(data) => data.clone(),
            JobOutput::Failed(message) => {
                return Err(Error::InvalidState(format!("Job {} failed: {}", job_id, message)))
            }
        };
        let data = match range {
            Some(range) => {
                let (start, end) = range.resolve(data.len() as u64)?;
                data.slice(start as usize..=end as usize)
            }
            None => data,
        };
        Ok(Box::pin(stream::iter(vec![Ok(data)])))
    }

    async fn initiate_multipart_upload(
        &self,
        description: &str,
        part_size: u64,
        token: &CancellationToken,
    ) -> Result<String> {
        ensure_active(token)?;
        if part_size == 0 || !part_size.is_power_of_two() || part_size < 1024 * 1024 {
            return Err(Error::InvalidInput(format!("Invalid part size {}", part_size)));
        }
        let mut state = self.lock();
        let id = state.next_id("upload");
        state.uploads.insert(
            id.clone(),
            Upload {
                description: description.to_string(),
                part_size,
                parts: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        offset: u64,
        data: Bytes,
        tree_hash: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        ensure_active(token)?;
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::NotFound(format!("Upload {} does not exist", upload_id)))?;
        if offset % upload.part_size != 0 || data.len() as u64 > upload.part_size {
            return Err(Error::InvalidInput(format!(
                "Part at {} does not fit part size {}",
                offset, upload.part_size
            )));
        }
        if tree_hash_hex(&data) != tree_hash {
            return Err(Error::InvalidInput(format!(
                "Tree hash mismatch for part at {}",
                offset
            )));
        }
        upload.parts.insert(offset, data);
        Ok(())
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        archive_size: u64,
        tree_hash: &str,
        token: &CancellationToken,
    ) -> Result<String> {
        ensure_active(token)?;
        let mut state = self.lock();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Error::NotFound(format!("Upload {} does not exist", upload_id)))?;

        let mut offsets: Vec<u64> = upload.parts.keys().copied().collect();
        offsets.sort_unstable();
        let mut data = BytesMut::new();
        for offset in offsets {
            if offset != data.len() as u64 {
                return Err(Error::InvalidInput(format!(
                    "Upload {} is missing data at {}",
                    upload_id,
                    data.len()
                )));
            }
            data.extend_from_slice(&upload.parts[&offset]);
        }
        let data = data.freeze();

        if data.len() as u64 != archive_size {
            return Err(Error::InvalidInput(format!(
                "Archive size {} does not match the {} bytes uploaded",
                archive_size,
                data.len()
            )));
        }
        if tree_hash_hex(&data) != tree_hash {
            return Err(Error::InvalidInput("Archive tree hash mismatch".to_string()));
        }

        let id = state.next_id("archive");
        state.archives.insert(
            id.clone(),
            Archive {
                description: upload.description,
                data,
                created: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn abort_multipart_upload(
        &self,
        upload_id: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        ensure_active(token)?;
        self.lock()
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Upload {} does not exist", upload_id)))
    }

    async fn delete_archive(&self, archive_id: &str, token: &CancellationToken) -> Result<()> {
        ensure_active(token)?;
        self.lock()
            .archives
            .remove(archive_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Archive {} does not exist", archive_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn output(glacier: &MemoryGlacier, job_id: &str, range: Option<ByteRange>) -> Vec<u8> {
        let token = CancellationToken::new();
        let chunks: Vec<Bytes> = glacier
            .get_job_output(job_id, range, &token)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_job_completes_after_delay() {
        let glacier = MemoryGlacier::new();
        glacier.set_job_delay(2);
        let token = CancellationToken::new();
        let id = glacier.initiate_job(&JobRequest::Inventory, &token).await.unwrap();

        for _ in 0..2 {
            let description = glacier.describe_job(&id, &token).await.unwrap();
            assert_eq!(description.status_code, JobStatus::InProgress);
        }
        let description = glacier.describe_job(&id, &token).await.unwrap();
        assert_eq!(description.status_code, JobStatus::Succeeded);
        assert_eq!(glacier.inventory_job_count(), 1);
    }

    #[tokio::test]
    async fn test_inventory_is_snapshot() {
        let glacier = MemoryGlacier::new();
        let token = CancellationToken::new();
        glacier.insert_archive("a.txt", Bytes::from_static(b"a"), Utc::now());
        let id = glacier.initiate_job(&JobRequest::Inventory, &token).await.unwrap();
        glacier.insert_archive("b.txt", Bytes::from_static(b"b"), Utc::now());

        let inventory: Inventory =
            serde_json::from_slice(&output(&glacier, &id, None).await).unwrap();
        assert_eq!(inventory.archive_list.len(), 1);
        assert_eq!(inventory.archive_list[0].archive_description, "a.txt");
    }

    #[tokio::test]
    async fn test_multipart_upload_and_retrieval() {
        let glacier = MemoryGlacier::new();
        let token = CancellationToken::new();
        let part = 1024 * 1024;
        let data: Vec<u8> = (0..part + 10).map(|i| (i % 251) as u8).collect();
        let data = Bytes::from(data);

        let upload = glacier
            .initiate_multipart_upload("big.bin", part as u64, &token)
            .await
            .unwrap();
        let first = data.slice(..part);
        let second = data.slice(part..);
        glacier
            .upload_part(&upload, 0, first.clone(), &tree_hash_hex(&first), &token)
            .await
            .unwrap();
        glacier
            .upload_part(&upload, part as u64, second.clone(), &tree_hash_hex(&second), &token)
            .await
            .unwrap();
        let archive = glacier
            .complete_multipart_upload(&upload, data.len() as u64, &tree_hash_hex(&data), &token)
            .await
            .unwrap();

        let request = JobRequest::ArchiveRetrieval { archive_id: archive };
        let job = glacier.initiate_job(&request, &token).await.unwrap();
        assert_eq!(output(&glacier, &job, None).await, data.to_vec());

        let range = ByteRange::new(part as u64, None).unwrap();
        assert_eq!(output(&glacier, &job, Some(range)).await, second.to_vec());
    }

    #[tokio::test]
    async fn test_bad_tree_hash_rejected() {
        let glacier = MemoryGlacier::new();
        let token = CancellationToken::new();
        let upload = glacier
            .initiate_multipart_upload("x", 1024 * 1024, &token)
            .await
            .unwrap();
        let result = glacier
            .upload_part(&upload, 0, Bytes::from_static(b"abc"), "00", &token)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_failed_jobs() {
        let glacier = MemoryGlacier::new();
        glacier.fail_jobs(Some("vault locked"));
        let token = CancellationToken::new();
        let id = glacier.initiate_job(&JobRequest::Inventory, &token).await.unwrap();
        let description = glacier.describe_job(&id, &token).await.unwrap();
        assert_eq!(description.status_code, JobStatus::Failed);
        assert_eq!(description.status_message.as_deref(), Some("vault locked"));
    }
}
