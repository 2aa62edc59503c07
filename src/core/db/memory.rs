use std::collections::{HashMap, HashSet};

use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::JobStore;
use crate::errors::{StoreError, StoreResult};
use crate::jobs::model::{BatchId, JobId, JobRecord, JobState};
use crate::models::RedactionResult;

/// In-process job store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(&self, id: JobId, to: JobState, apply: F) -> StoreResult<u32>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .filter(|job| allowed(job.state, to))
            .ok_or_else(|| StoreError::InvalidTransition {
                job_id: id.to_string(),
                to: to.as_str(),
            })?;
        job.state = to;
        job.updated_at = OffsetDateTime::now_utc();
        apply(job);
        Ok(job.attempts)
    }
}

fn allowed(from: JobState, to: JobState) -> bool {
    match to {
        JobState::Started | JobState::Failure => {
            matches!(from, JobState::Pending | JobState::Started)
        }
        JobState::Success => from == JobState::Started,
        JobState::Pending => false,
    }
}

impl JobStore for MemoryJobStore {
    async fn insert(&self, new_jobs: &[JobRecord]) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(dup) = new_jobs.iter().find(|job| jobs.contains_key(&job.id)) {
            return Err(StoreError::Corrupt(format!("duplicate job id {}", dup.id)));
        }
        for job in new_jobs {
            jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn load(&self, id: JobId) -> StoreResult<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn load_batch(&self, batch_id: BatchId) -> StoreResult<Vec<JobRecord>> {
        let jobs = self.jobs.read().await;
        let mut batch: Vec<JobRecord> = jobs
            .values()
            .filter(|job| job.batch_id == Some(batch_id))
            .cloned()
            .collect();
        batch.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(batch)
    }

    async fn mark_started(&self, id: JobId) -> StoreResult<u32> {
        self.transition(id, JobState::Started, |job| job.attempts += 1)
            .await
    }

    async fn mark_success(&self, id: JobId, result: &RedactionResult) -> StoreResult<()> {
        let result = result.clone();
        self.transition(id, JobState::Success, move |job| {
            job.result = Some(result);
            job.error = None;
        })
        .await?;
        Ok(())
    }

    async fn mark_failure(&self, id: JobId, reason: &str) -> StoreResult<()> {
        let reason = reason.to_string();
        self.transition(id, JobState::Failure, move |job| job.error = Some(reason))
            .await?;
        Ok(())
    }

    async fn fail_incomplete(&self, reason: &str) -> StoreResult<u64> {
        let mut jobs = self.jobs.write().await;
        let now = OffsetDateTime::now_utc();
        let mut failed = 0;
        for job in jobs.values_mut().filter(|job| !job.state.is_terminal()) {
            job.state = JobState::Failure;
            job.error = Some(reason.to_string());
            job.updated_at = now;
            failed += 1;
        }
        Ok(failed)
    }

    async fn succeeded_artifacts(&self) -> StoreResult<HashSet<String>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.state == JobState::Success)
            .filter_map(|job| job.result.as_ref())
            .map(|result| result.output_image.clone())
            .collect())
    }

    async fn count(&self) -> StoreResult<u64> {
        Ok(self.jobs.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_follow_the_state_machine() {
        let store = MemoryJobStore::new();
        let job = JobRecord::new(JobId::new(), None, "car.jpg");
        let id = job.id;
        store.insert(&[job]).await.unwrap();

        assert!(store.mark_success(id, &sample_result()).await.is_err());
        assert_eq!(store.mark_started(id).await.unwrap(), 1);
        assert_eq!(store.mark_started(id).await.unwrap(), 2);
        store.mark_success(id, &sample_result()).await.unwrap();
        assert!(store.mark_failure(id, "render_failed").await.is_err());

        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Success);
        assert_eq!(loaded.attempts, 2);
        let artifacts = store.succeeded_artifacts().await.unwrap();
        assert!(artifacts.contains("redacted/x.jpg"));
    }

    #[tokio::test]
    async fn fail_incomplete_only_touches_running_jobs() {
        let store = MemoryJobStore::new();
        let done = JobRecord::new(JobId::new(), None, "a.jpg");
        let waiting = JobRecord::new(JobId::new(), None, "b.jpg");
        let (done_id, waiting_id) = (done.id, waiting.id);
        store.insert(&[done, waiting]).await.unwrap();
        store.mark_started(done_id).await.unwrap();
        store.mark_failure(done_id, "render_failed").await.unwrap();

        assert_eq!(store.fail_incomplete("interrupted").await.unwrap(), 1);
        let waiting = store.load(waiting_id).await.unwrap().unwrap();
        assert_eq!(waiting.error.as_deref(), Some("interrupted"));
        let done = store.load(done_id).await.unwrap().unwrap();
        assert_eq!(done.error.as_deref(), Some("render_failed"));
    }

    fn sample_result() -> RedactionResult {
        RedactionResult {
            source_image: "car.jpg".to_string(),
            output_image: "redacted/x.jpg".to_string(),
            regions_redacted: 0,
            detector_versions: Default::default(),
        }
    }
}
