use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::RedactionResult;

/// Identifier of one redaction job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

/// Identifier of a group of jobs submitted together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(JobId);
uuid_id!(BatchId);

/// Persisted job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Started,
    Success,
    Failure,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }
}

impl TryFrom<i64> for JobState {
    type Error = StoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(JobState::Pending),
            1 => Ok(JobState::Started),
            2 => Ok(JobState::Success),
            3 => Ok(JobState::Failure),
            _ => Err(StoreError::Corrupt(format!("Invalid JobState value: {}", value))),
        }
    }
}

impl From<JobState> for i64 {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Pending => 0,
            JobState::Started => 1,
            JobState::Success => 2,
            JobState::Failure => 3,
        }
    }
}

/// A job as stored by a [`JobStore`](crate::core::db::JobStore)
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub batch_id: Option<BatchId>,
    /// Label of the submitted image
    pub source: String,
    pub state: JobState,
    pub result: Option<RedactionResult>,
    /// Public failure reason
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl JobRecord {
    pub fn new(id: JobId, batch_id: Option<BatchId>, source: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            batch_id,
            source: source.into(),
            state: JobState::Pending,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Started => JobStatus::Started,
            JobState::Success => match &self.result {
                Some(result) => JobStatus::Success(result.clone()),
                None => JobStatus::Failure("missing_result".to_string()),
            },
            JobState::Failure => JobStatus::Failure(
                self.error.clone().unwrap_or_else(|| "job_failed".to_string()),
            ),
        }
    }
}

/// What a caller polling a job sees.
///
/// `Unavailable` is produced at query time when the store cannot be reached
/// and is never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Started,
    Success(RedactionResult),
    Failure(String),
    Unavailable,
    Unknown,
}

pub const BACKEND_UNAVAILABLE_ERROR: &str = "jobs_backend_unavailable";

impl JobStatus {
    pub fn state_name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Started => "STARTED",
            JobStatus::Success(_) => "SUCCESS",
            JobStatus::Failure(_) => "FAILURE",
            JobStatus::Unavailable => "UNAVAILABLE",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success(_) | JobStatus::Failure(_))
    }

    /// 503 while the job backend is unreachable, 200 otherwise
    pub fn http_status(&self) -> u16 {
        match self {
            JobStatus::Unavailable => 503,
            _ => 200,
        }
    }

    pub fn payload(&self, job_id: JobId) -> StatusPayload {
        let (result, error) = match self {
            JobStatus::Success(result) => (Some(result.clone()), None),
            JobStatus::Failure(reason) => (None, Some(reason.clone())),
            JobStatus::Unavailable => (None, Some(BACKEND_UNAVAILABLE_ERROR.to_string())),
            _ => (None, None),
        };
        StatusPayload {
            task_id: job_id.to_string(),
            state: self.state_name(),
            result,
            error,
        }
    }
}

/// Serialisable form of a [`JobStatus`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPayload {
    pub task_id: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RedactionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate state of a batch, derived from its members on every query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Pending,
    Success,
    Failure,
    Unavailable,
}

impl BatchState {
    /// `Success` iff every member succeeded, `Failure` iff one failed and none
    /// is still running, `Pending` otherwise.
    pub fn derive<I>(states: I) -> Self
    where
        I: IntoIterator<Item = JobState>,
    {
        let mut any_failed = false;
        let mut any_running = false;
        for state in states {
            match state {
                JobState::Pending | JobState::Started => any_running = true,
                JobState::Failure => any_failed = true,
                JobState::Success => {}
            }
        }
        match (any_running, any_failed) {
            (true, _) => BatchState::Pending,
            (false, true) => BatchState::Failure,
            (false, false) => BatchState::Success,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Success => "SUCCESS",
            BatchState::Failure => "FAILURE",
            BatchState::Unavailable => "UNAVAILABLE",
        }
    }
}
