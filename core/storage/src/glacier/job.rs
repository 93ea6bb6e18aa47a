//! Glacier job lifecycle.

use tracing::{debug, info, warn};

use stowage_common::{poll_until, CancellationToken, Error, PollStatus, Result, RetryConfig};

use super::api::{GlacierApi, JobDescription, JobRequest, JobStatus};

/// Local view of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Accepted by Glacier, not described yet.
    Initiated,
    InProgress,
    Succeeded,
    Failed(String),
}

impl JobState {
    /// Whether the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed(_))
    }
}

/// A job started by this instance.
#[derive(Debug, Clone)]
pub struct Job {
    id: String,
    request: JobRequest,
    state: JobState,
}

impl Job {
    /// Track a job Glacier just accepted.
    pub fn new(id: impl Into<String>, request: JobRequest) -> Self {
        Self {
            id: id.into(),
            request,
            state: JobState::Initiated,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Apply a `DescribeJob` result.
    ///
    /// # Errors
    /// - `InvalidState` if the description belongs to another job or moves
    ///   a finished job to a different state
    pub fn observe(&mut self, description: &JobDescription) -> Result<&JobState> {
        if description.job_id != self.id {
            return Err(Error::InvalidState(format!(
                "Description of job {} applied to job {}",
                description.job_id, self.id
            )));
        }

        let next = match description.status_code {
            JobStatus::InProgress => JobState::InProgress,
            JobStatus::Succeeded => JobState::Succeeded,
            JobStatus::Failed => JobState::Failed(
                description
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "no status message".to_string()),
            ),
        };

        if self.state.is_terminal() && next != self.state {
            return Err(Error::InvalidState(format!(
                "Job {} moved from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        if next != self.state {
            debug!("Job {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
        Ok(&self.state)
    }
}

/// Start a job and poll it until it finishes.
///
/// # Errors
/// - `InvalidState` if Glacier reports the job as failed
/// - `Timeout` if the job is still running when the budget runs out
/// - `Cancelled` if the token fires while waiting
pub async fn run_job(
    api: &dyn GlacierApi,
    request: JobRequest,
    poll: &RetryConfig,
    token: &CancellationToken,
) -> Result<Job> {
    let id = api.initiate_job(&request, token).await?;
    info!("Started Glacier job {} ({:?})", id, request);
    let mut job = Job::new(id, request);

    let what = format!("Glacier job {}", job.id());
    let job_id = job.id().to_string();
    let description = poll_until(poll, token, &what, || {
        let job_id = job_id.as_str();
        async move {
            let description = api.describe_job(job_id, token).await?;
            if description.status_code == JobStatus::InProgress {
                Ok(PollStatus::Pending)
            } else {
                Ok(PollStatus::Ready(description))
            }
        }
    })
    .await?;

    let state = job.observe(&description)?.clone();
    match state {
        JobState::Succeeded => {
            info!("Glacier job {} succeeded", job.id());
            Ok(job)
        }
        JobState::Failed(message) => {
            warn!("Glacier job {} failed: {}", job.id(), message);
            Err(Error::InvalidState(format!(
                "Glacier job {} failed: {}",
                job.id(),
                message
            )))
        }
        other => Err(Error::InvalidState(format!(
            "Glacier job {} stopped polling in state {:?}",
            job.id(),
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn described(id: &str, status: JobStatus) -> JobDescription {
        JobDescription {
            job_id: id.to_string(),
            status_code: status,
            status_message: Some("boom".to_string()),
            completed: status != JobStatus::InProgress,
        }
    }

    #[test]
    fn test_job_transitions() {
        let mut job = Job::new("j1", JobRequest::Inventory);
        assert_eq!(job.state(), &JobState::Initiated);

        job.observe(&described("j1", JobStatus::InProgress)).unwrap();
        assert_eq!(job.state(), &JobState::InProgress);

        job.observe(&described("j1", JobStatus::Succeeded)).unwrap();
        assert!(job.state().is_terminal());

        // Repeating the terminal state is fine, leaving it is not.
        job.observe(&described("j1", JobStatus::Succeeded)).unwrap();
        assert!(job.observe(&described("j1", JobStatus::InProgress)).is_err());
    }

    #[test]
    fn test_failed_job_keeps_message() {
        let mut job = Job::new("j2", JobRequest::Inventory);
        let state = job.observe(&described("j2", JobStatus::Failed)).unwrap();
        assert_eq!(state, &JobState::Failed("boom".to_string()));
    }

    #[test]
    fn test_foreign_description_rejected() {
        let mut job = Job::new("j3", JobRequest::Inventory);
        assert!(matches!(
            job.observe(&described("other", JobStatus::Succeeded)),
            Err(Error::InvalidState(_))
        ));
    }
}
