mod memory;
mod sqlite;

use std::collections::HashSet;
use std::future::Future;

use crate::errors::StoreResult;
use crate::jobs::model::{BatchId, JobId, JobRecord};
use crate::models::RedactionResult;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Durable record of jobs and their state transitions.
///
/// Allowed transitions: `Pending -> Started`, `Started -> Started` (retry),
/// `Started -> Success | Failure`, and `Pending -> Failure` for jobs that can
/// no longer run. Anything else is `StoreError::InvalidTransition`.
pub trait JobStore: Send + Sync + 'static {
    /// Insert all records or none of them.
    fn insert(&self, jobs: &[JobRecord]) -> impl Future<Output = StoreResult<()>> + Send;

    fn load(&self, id: JobId) -> impl Future<Output = StoreResult<Option<JobRecord>>> + Send;

    fn load_batch(&self, batch_id: BatchId)
    -> impl Future<Output = StoreResult<Vec<JobRecord>>> + Send;

    /// Move to `Started` and return the attempt number (1-based).
    fn mark_started(&self, id: JobId) -> impl Future<Output = StoreResult<u32>> + Send;

    fn mark_success(
        &self,
        id: JobId,
        result: &RedactionResult,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn mark_failure(&self, id: JobId, reason: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// Fail every job still pending or started, e.g. after an unclean shutdown.
    /// Returns how many jobs were affected.
    fn fail_incomplete(&self, reason: &str) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Artifact paths recorded by successful jobs
    fn succeeded_artifacts(&self) -> impl Future<Output = StoreResult<HashSet<String>>> + Send;

    /// Total number of stored jobs
    fn count(&self) -> impl Future<Output = StoreResult<u64>> + Send;
}
