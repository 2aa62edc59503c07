pub mod model;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::JobConfig;
use crate::core::db::{JobStore, MemoryJobStore};
use crate::errors::{RedactError, RenderError};
use crate::models::RedactionResult;
use crate::pipeline::RedactionPipeline;
use crate::source::ImageInput;

pub use model::{
    BACKEND_UNAVAILABLE_ERROR, BatchId, BatchState, JobId, JobRecord, JobState, JobStatus,
    StatusPayload,
};

/// Failure reason for jobs left running by a previous process
pub const INTERRUPTED: &str = "interrupted";
/// Failure reason when the job store or a worker misbehaved
pub const INTERNAL_ERROR: &str = "internal_error";
const INPUT_LOST: &str = "input_lost";
/// Tries at recording a finished job before it is failed
const RECORD_ATTEMPTS: u32 = 2;

/// One async mutex per key, so jobs on the same image never run concurrently.
#[derive(Default)]
struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Only the map holds idle locks
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

struct Inner<S> {
    store: S,
    pipeline: Arc<RedactionPipeline>,
    /// Inputs of jobs not yet finished
    inputs: StdMutex<HashMap<JobId, ImageInput>>,
    locks: KeyedLocks,
    /// Held shared from render until the result is recorded; cleanup takes it exclusively
    publishing: RwLock<()>,
    max_attempts: u32,
}

impl<S: JobStore> Inner<S> {
    fn new(store: S, pipeline: RedactionPipeline, max_attempts: u32) -> Self {
        Self {
            store,
            pipeline: Arc::new(pipeline),
            inputs: StdMutex::new(HashMap::new()),
            locks: KeyedLocks::default(),
            publishing: RwLock::new(()),
            max_attempts: max_attempts.max(1),
        }
    }

    fn pending_inputs(&self) -> MutexGuard<'_, HashMap<JobId, ImageInput>> {
        self.inputs.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fail(&self, id: JobId, reason: &str) {
        if let Err(e) = self.store.mark_failure(id, reason).await {
            error!("Job {}: could not record failure '{}': {}", id, reason, e);
        }
    }

    /// Run one job to a terminal state.
    async fn execute(&self, id: JobId) {
        let input = self.pending_inputs().get(&id).cloned();
        let Some(input) = input else {
            warn!("Job {} has no pending input", id);
            self.fail(id, INPUT_LOST).await;
            return;
        };

        self.run(id, input).await;
        self.pending_inputs().remove(&id);
    }

    async fn run(&self, id: JobId, input: ImageInput) {
        let label = input.label();
        let key_input = input.clone();
        let key = tokio::task::spawn_blocking(move || key_input.identity())
            .await
            .unwrap_or(label);
        let _image_guard = self.locks.lock(&key).await;
        let _publishing = self.publishing.read().await;

        loop {
            let attempt = match self.store.mark_started(id).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    error!("Job {}: could not mark started: {}", id, e);
                    self.fail(id, INTERNAL_ERROR).await;
                    return;
                }
            };
            debug!("Job {} attempt {}/{}", id, attempt, self.max_attempts);

            let pipeline = self.pipeline.clone();
            let job_input = input.clone();
            let outcome = tokio::task::spawn_blocking(move || pipeline.run(&job_input)).await;

            match outcome {
                Ok(Ok(result)) => {
                    self.record_success(id, &result).await;
                    return;
                }
                Ok(Err(e)) if attempt < self.max_attempts => {
                    warn!("Job {} attempt {} failed, retrying: {}", id, attempt, e);
                }
                Ok(Err(e)) => {
                    warn!("Job {} failed: {}", id, e);
                    self.fail(id, e.public_reason()).await;
                    return;
                }
                Err(e) => {
                    error!("Job {} aborted: {}", id, e);
                    self.fail(id, INTERNAL_ERROR).await;
                    return;
                }
            }
        }
    }

    /// Record a published artifact. If that keeps failing the job fails and
    /// the artifact is withdrawn unless another successful job owns the same path.
    async fn record_success(&self, id: JobId, result: &RedactionResult) {
        for attempt in 1..=RECORD_ATTEMPTS {
            match self.store.mark_success(id, result).await {
                Ok(()) => {
                    info!(
                        "Job {} succeeded: {} region(s) -> {}",
                        id, result.regions_redacted, result.output_image
                    );
                    return;
                }
                Err(e) => warn!("Job {}: could not record success (try {}): {}", id, attempt, e),
            }
        }

        error!("Job {} rendered but could not be recorded; failing it", id);
        self.fail(id, INTERNAL_ERROR).await;
        match self.store.succeeded_artifacts().await {
            Ok(owned) if owned.contains(&result.output_image) => {
                debug!("Artifact {} is kept for another job", result.output_image);
            }
            Ok(_) => {
                if let Err(e) = self.pipeline.renderer().remove_artifact(&result.output_image) {
                    error!("Job {}: {}", id, e);
                }
            }
            // Left for cleanup_failed
            Err(e) => warn!("Job {}: cannot check artifact ownership: {}", id, e),
        }
    }
}

enum Mode {
    /// Jobs run inside `submit`, one at a time
    InProcess { running: Mutex<()> },
    Workers {
        queue: mpsc::UnboundedSender<JobId>,
        workers: Vec<JoinHandle<()>>,
    },
}

/// Schedules redaction jobs and answers status queries.
pub struct Orchestrator<S: JobStore> {
    inner: Arc<Inner<S>>,
    mode: Mode,
}

impl Orchestrator<MemoryJobStore> {
    /// Degraded mode without a job backend: an in-memory store, and every job is
    /// executed before `submit` returns.
    pub fn in_process(pipeline: RedactionPipeline) -> Self {
        info!("No job backend configured; running jobs in-process");
        Self {
            inner: Arc::new(Inner::new(MemoryJobStore::new(), pipeline, 1)),
            mode: Mode::InProcess {
                running: Mutex::new(()),
            },
        }
    }
}

impl<S: JobStore> Orchestrator<S> {
    /// Start `config.workers` workers over `store`.
    ///
    /// Jobs a previous process left pending or started are failed first; their
    /// inputs were never persisted and cannot be resumed.
    pub async fn with_backend(
        store: S,
        pipeline: RedactionPipeline,
        config: &JobConfig,
    ) -> Result<Self, RedactError> {
        let stale = store.fail_incomplete(INTERRUPTED).await?;
        if stale > 0 {
            warn!("Marked {} interrupted job(s) as failed", stale);
        }
        match pipeline.renderer().cleanup_partial() {
            Ok(0) => {}
            Ok(n) => info!("Removed {} partial artifact(s)", n),
            Err(e) => warn!("Failed to clean partial artifacts: {}", e),
        }

        let inner = Arc::new(Inner::new(store, pipeline, config.max_attempts));
        let (queue, rx) = mpsc::unbounded_channel::<JobId>();
        let rx = Arc::new(Mutex::new(rx));
        let worker_count = config.workers.max(1);
        let workers = (0..worker_count)
            .map(|n| spawn_worker(n, inner.clone(), rx.clone()))
            .collect();
        info!("Started {} job worker(s)", worker_count);

        Ok(Self {
            inner,
            mode: Mode::Workers { queue, workers },
        })
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn pipeline(&self) -> &RedactionPipeline {
        &self.inner.pipeline
    }

    pub async fn submit(&self, input: ImageInput) -> Result<JobId, RedactError> {
        let ids = self.enqueue(vec![input], None).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| RedactError::InvalidInput("nothing submitted".to_string()))
    }

    /// Submit one job per image. Either every input is accepted or none is.
    pub async fn submit_many(
        &self,
        inputs: Vec<ImageInput>,
    ) -> Result<(BatchId, Vec<JobId>), RedactError> {
        let batch_id = BatchId::new();
        let ids = self.enqueue(inputs, Some(batch_id)).await?;
        Ok((batch_id, ids))
    }

    async fn enqueue(
        &self,
        inputs: Vec<ImageInput>,
        batch_id: Option<BatchId>,
    ) -> Result<Vec<JobId>, RedactError> {
        if inputs.is_empty() {
            return Err(RedactError::InvalidInput("no images submitted".to_string()));
        }
        for input in &inputs {
            input.validate()?;
        }

        let jobs: Vec<(JobRecord, ImageInput)> = inputs
            .into_iter()
            .map(|input| (JobRecord::new(JobId::new(), batch_id, input.label()), input))
            .collect();
        let records: Vec<JobRecord> = jobs.iter().map(|(record, _)| record.clone()).collect();
        self.inner.store.insert(&records).await?;

        let ids: Vec<JobId> = records.iter().map(|record| record.id).collect();
        {
            let mut pending = self.inner.pending_inputs();
            for (record, input) in jobs {
                pending.insert(record.id, input);
            }
        }
        info!("Submitted {} job(s)", ids.len());

        match &self.mode {
            Mode::InProcess { running } => {
                for id in &ids {
                    let _running = running.lock().await;
                    self.inner.execute(*id).await;
                }
            }
            Mode::Workers { queue, .. } => {
                for id in &ids {
                    if queue.send(*id).is_err() {
                        error!("Job queue closed; failing job {}", id);
                        self.inner.pending_inputs().remove(id);
                        self.inner.fail(*id, INTERNAL_ERROR).await;
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Current status. Never waits for the job.
    pub async fn status(&self, id: JobId) -> JobStatus {
        match self.inner.store.load(id).await {
            Ok(Some(record)) => record.status(),
            Ok(None) => JobStatus::Unknown,
            Err(e) => {
                warn!("Job store unreachable while polling {}: {}", id, e);
                JobStatus::Unavailable
            }
        }
    }

    /// Aggregate state of `ids`, derived from their current statuses.
    /// Unknown ids count as failed.
    pub async fn batch_status(&self, ids: &[JobId]) -> BatchState {
        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            let state = match self.status(*id).await {
                JobStatus::Unavailable => return BatchState::Unavailable,
                JobStatus::Pending => JobState::Pending,
                JobStatus::Started => JobState::Started,
                JobStatus::Success(_) => JobState::Success,
                JobStatus::Failure(_) | JobStatus::Unknown => JobState::Failure,
            };
            states.push(state);
        }
        BatchState::derive(states)
    }

    /// Job ids submitted together under `batch_id`
    pub async fn batch_members(&self, batch_id: BatchId) -> Result<Vec<JobId>, RedactError> {
        let records = self.inner.store.load_batch(batch_id).await?;
        Ok(records.into_iter().map(|record| record.id).collect())
    }

    /// Poll until the job is terminal, the backend becomes unavailable, or
    /// `timeout` elapses; returns the last status seen.
    pub async fn wait(&self, id: JobId, poll: Duration, timeout: Duration) -> JobStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(id).await;
            let done = status.is_terminal()
                || matches!(status, JobStatus::Unavailable | JobStatus::Unknown);
            if done || tokio::time::Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Delete what failed or interrupted jobs left in the output directory:
    /// temp files, and artifacts no successful job in this store refers to.
    ///
    /// With an in-memory store only this process's jobs count, so artifacts of
    /// earlier runs are removed too. Waits for jobs that are publishing.
    pub async fn cleanup_failed(&self) -> Result<usize, RedactError> {
        let _exclusive = self.inner.publishing.write().await;
        let renderer = self.inner.pipeline.renderer();

        let mut removed = renderer.cleanup_partial().map_err(|source| RenderError::Cleanup {
            path: renderer.base_dir().display().to_string(),
            source,
        })?;
        let owned = self.inner.store.succeeded_artifacts().await?;
        for artifact in renderer.artifacts()? {
            if !owned.contains(&artifact) && renderer.remove_artifact(&artifact)? {
                removed += 1;
            }
        }
        info!("Cleanup removed {} file(s)", removed);
        Ok(removed)
    }

    /// Stop accepting work, let queued jobs finish and wait for every worker.
    pub async fn shutdown(self) {
        if let Mode::Workers { queue, workers } = self.mode {
            drop(queue);
            for worker in workers {
                if let Err(e) = worker.await {
                    warn!("Job worker ended abnormally: {}", e);
                }
            }
        }
        info!("Orchestrator stopped");
    }
}

fn spawn_worker<S: JobStore>(
    n: usize,
    inner: Arc<Inner<S>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<JobId>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(id) = next else {
                break;
            };
            inner.execute(id).await;
        }
        debug!("Job worker {} stopped", n);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyed_locks_serialise_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let guard = locks.lock("a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("a").await;
        });
        // A different key is not blocked
        let _b = locks.lock("b").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
