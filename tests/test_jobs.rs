//! Integration tests for job orchestration.
//!
//! Tests cover:
//! - In-process execution: success, failure and rejected input
//! - Batch submission and aggregate state
//! - Worker pool over a SQLite job store
//! - Backend outages surfacing as UNAVAILABLE
//! - Recovery of jobs interrupted by a restart
//! - Retries
//! - Job store writes failing mid-job
//! - Cleanup of artifacts left by failed jobs

mod common;

use std::sync::Arc;
use std::time::Duration;

use platescrub::config::JobConfig;
use platescrub::jobs::{BACKEND_UNAVAILABLE_ERROR, INTERNAL_ERROR, INTERRUPTED};

use common::*;

const POLL: Duration = Duration::from_millis(20);
const TIMEOUT: Duration = Duration::from_secs(30);

fn job_config(workers: usize, max_attempts: u32) -> JobConfig {
    JobConfig {
        database: None,
        workers,
        max_attempts,
    }
}

#[tokio::test]
async fn test_in_process_job_succeeds() -> anyhow::Result<()> {
    // 1. Submit without a backend
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let orchestrator = Orchestrator::in_process(scene_pipeline(outputs.path()));
    let id = orchestrator.submit(ImageInput::path(&input)).await?;

    // 2. The job already ran
    let status = orchestrator.status(id).await;
    let JobStatus::Success(result) = &status else {
        panic!("expected success, got {:?}", status);
    };
    assert_eq!(result.regions_redacted, 1);
    assert!(outputs.path().join(&result.output_image).is_file());

    // 3. The status payload carries the result
    assert_eq!(status.http_status(), 200);
    let payload = serde_json::to_value(status.payload(id))?;
    assert_eq!(payload["state"], "SUCCESS");
    assert_eq!(payload["task_id"], id.to_string());
    assert_eq!(payload["result"]["regions_redacted"], 1);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_corrupt_image_fails_without_artifact() -> anyhow::Result<()> {
    let (inputs, outputs) = workspace();
    let input = write_corrupt(inputs.path(), "car.png");
    let orchestrator = Orchestrator::in_process(scene_pipeline(outputs.path()));

    let id = orchestrator.submit(ImageInput::path(&input)).await?;

    let status = orchestrator.status(id).await;
    assert!(matches!(&status, JobStatus::Failure(reason) if reason == "render_failed"));
    let payload = serde_json::to_value(status.payload(id))?;
    assert_eq!(payload["state"], "FAILURE");
    assert_eq!(payload["error"], "render_failed");
    assert!(payload.get("result").is_none());
    assert_eq!(artifact_count(outputs.path()), 0);

    Ok(())
}

#[tokio::test]
async fn test_invalid_input_creates_no_job() -> anyhow::Result<()> {
    let (inputs, outputs) = workspace();
    let orchestrator = Orchestrator::in_process(scene_pipeline(outputs.path()));

    // 1. Missing file and empty bytes are rejected up front
    let missing = orchestrator
        .submit(ImageInput::path(inputs.path().join("nope.png")))
        .await;
    assert!(matches!(missing, Err(RedactError::InvalidInput(_))));
    let empty = orchestrator.submit(ImageInput::bytes("empty.png", Vec::new())).await;
    assert!(matches!(empty, Err(RedactError::InvalidInput(_))));

    // 2. One bad image rejects the whole batch
    let good = write_scene(inputs.path(), "car.png");
    let batch = orchestrator
        .submit_many(vec![
            ImageInput::path(&good),
            ImageInput::bytes("empty.png", Vec::new()),
        ])
        .await;
    assert!(matches!(batch, Err(RedactError::InvalidInput(_))));
    assert!(matches!(
        orchestrator.submit_many(Vec::new()).await,
        Err(RedactError::InvalidInput(_))
    ));

    assert_eq!(orchestrator.store().count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_unknown_job_id() {
    let (_inputs, outputs) = workspace();
    let orchestrator = Orchestrator::in_process(scene_pipeline(outputs.path()));

    let status = orchestrator.status(JobId::new()).await;

    assert!(matches!(status, JobStatus::Unknown));
    assert!(!status.is_terminal());
}

#[tokio::test]
async fn test_batch_state_reflects_members() -> anyhow::Result<()> {
    let (inputs, outputs) = workspace();
    let orchestrator = Orchestrator::in_process(scene_pipeline(outputs.path()));
    let good = write_scene(inputs.path(), "good.png");
    let bad = write_corrupt(inputs.path(), "bad.png");

    // 1. All good
    let (ok_batch, ok_ids) = orchestrator
        .submit_many(vec![
            ImageInput::path(&good),
            ImageInput::bytes("same-car.png", scene_png_bytes()),
        ])
        .await?;
    assert_eq!(orchestrator.batch_status(&ok_ids).await, BatchState::Success);
    assert_eq!(orchestrator.batch_members(ok_batch).await?.len(), 2);

    // 2. One failure fails the batch
    let (_, mixed_ids) = orchestrator
        .submit_many(vec![ImageInput::path(&good), ImageInput::path(&bad)])
        .await?;
    assert_eq!(orchestrator.batch_status(&mixed_ids).await, BatchState::Failure);

    assert_eq!(orchestrator.store().count().await?, 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workers_process_jobs_from_sqlite_store() -> anyhow::Result<()> {
    // 1. Start a worker pool over a fresh database
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let store = SqliteJobStore::open(outputs.path().join("jobs.db")).await?;
    let orchestrator =
        Orchestrator::with_backend(store, scene_pipeline(outputs.path()), &job_config(3, 1))
            .await?;

    // 2. Three submissions of the same image share one artifact
    let (batch_id, ids) = orchestrator
        .submit_many(vec![
            ImageInput::path(&input),
            ImageInput::path(&input),
            ImageInput::path(&input),
        ])
        .await?;

    let mut outputs_seen = Vec::new();
    for id in &ids {
        match orchestrator.wait(*id, POLL, TIMEOUT).await {
            JobStatus::Success(result) => outputs_seen.push(result.output_image),
            other => panic!("job {} ended as {:?}", id, other),
        }
    }
    outputs_seen.dedup();
    assert_eq!(outputs_seen.len(), 1);
    assert_eq!(artifact_count(outputs.path()), 1);

    // 3. Batch bookkeeping comes from the database
    assert_eq!(orchestrator.batch_status(&ids).await, BatchState::Success);
    let mut members = orchestrator.batch_members(batch_id).await?;
    let mut expected = ids.clone();
    members.sort();
    expected.sort();
    assert_eq!(members, expected);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_backend_reports_unavailable() -> anyhow::Result<()> {
    // 1. Run one job to completion
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let db_path = outputs.path().join("jobs.db");
    let store = SqliteJobStore::open(&db_path).await?;
    let orchestrator =
        Orchestrator::with_backend(store, scene_pipeline(outputs.path()), &job_config(1, 1))
            .await?;
    let id = orchestrator.submit(ImageInput::path(&input)).await?;
    assert!(matches!(
        orchestrator.wait(id, POLL, TIMEOUT).await,
        JobStatus::Success(_)
    ));

    // 2. Take the backend away
    orchestrator.store().close().await;

    // 3. Polling reports UNAVAILABLE, never FAILURE
    for _ in 0..3 {
        let status = orchestrator.status(id).await;
        assert!(matches!(status, JobStatus::Unavailable));
        assert_eq!(status.http_status(), 503);
        let payload = serde_json::to_value(status.payload(id))?;
        assert_eq!(payload["state"], "UNAVAILABLE");
        assert_eq!(payload["error"], BACKEND_UNAVAILABLE_ERROR);
    }
    assert_eq!(orchestrator.batch_status(&[id]).await, BatchState::Unavailable);

    // 4. New submissions are refused instead of queued
    let refused = orchestrator.submit(ImageInput::path(&input)).await;
    assert!(matches!(refused, Err(RedactError::BackendUnreachable(_))));
    orchestrator.shutdown().await;

    // 5. Nothing was duplicated by polling or the refused submit
    let reopened = SqliteJobStore::open(&db_path).await?;
    assert_eq!(reopened.count().await?, 1);
    reopened.close().await;

    Ok(())
}

#[tokio::test]
async fn test_restart_fails_interrupted_jobs() -> anyhow::Result<()> {
    // 1. A previous process left one job pending and one started
    let (_inputs, outputs) = workspace();
    let db_path = outputs.path().join("jobs.db");
    let store = SqliteJobStore::open(&db_path).await?;
    let pending = JobRecord::new(JobId::new(), None, "a.png");
    let started = JobRecord::new(JobId::new(), None, "b.png");
    let (pending_id, started_id) = (pending.id, started.id);
    store.insert(&[pending, started]).await?;
    store.mark_started(started_id).await?;
    store.close().await;

    // 2. Start again over the same database
    let store = SqliteJobStore::open(&db_path).await?;
    let orchestrator =
        Orchestrator::with_backend(store, scene_pipeline(outputs.path()), &job_config(1, 1))
            .await?;

    // 3. Neither job is left hanging
    for id in [pending_id, started_id] {
        let status = orchestrator.status(id).await;
        assert!(
            matches!(&status, JobStatus::Failure(reason) if reason == INTERRUPTED),
            "got {:?}",
            status
        );
    }

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_transient_failure_is_retried() -> anyhow::Result<()> {
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let pipeline = RedactionPipeline::new(renderer(outputs.path()))
        .add_detector(Arc::new(FlakyDetector::new(1)));
    let orchestrator =
        Orchestrator::with_backend(MemoryJobStore::new(), pipeline, &job_config(1, 2)).await?;

    let id = orchestrator.submit(ImageInput::path(&input)).await?;
    let status = orchestrator.wait(id, POLL, TIMEOUT).await;

    assert!(matches!(status, JobStatus::Success(_)), "got {:?}", status);
    let record = orchestrator.store().load(id).await?.expect("job exists");
    assert_eq!(record.attempts, 2);
    assert_eq!(record.state, JobState::Success);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_job() -> anyhow::Result<()> {
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let pipeline = RedactionPipeline::new(renderer(outputs.path()))
        .add_detector(Arc::new(FlakyDetector::new(5)));
    let orchestrator =
        Orchestrator::with_backend(MemoryJobStore::new(), pipeline, &job_config(1, 2)).await?;

    let id = orchestrator.submit(ImageInput::path(&input)).await?;
    let status = orchestrator.wait(id, POLL, TIMEOUT).await;

    assert!(matches!(&status, JobStatus::Failure(reason) if reason == "detector_unavailable"));
    assert_eq!(artifact_count(outputs.path()), 0);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_start_record_fails_the_job() -> anyhow::Result<()> {
    // 1. The store rejects the first transition to STARTED
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let orchestrator = Orchestrator::with_backend(
        FaultyStore::new(1, 0),
        scene_pipeline(outputs.path()),
        &job_config(1, 1),
    )
    .await?;

    // 2. The job reaches a terminal state instead of staying PENDING
    let id = orchestrator.submit(ImageInput::path(&input)).await?;
    let status = orchestrator.wait(id, POLL, TIMEOUT).await;
    assert!(
        matches!(&status, JobStatus::Failure(reason) if reason == INTERNAL_ERROR),
        "got {:?}",
        status
    );
    assert!(status.is_terminal());
    assert_eq!(artifact_count(outputs.path()), 0);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_success_record_is_retried_once() -> anyhow::Result<()> {
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let orchestrator = Orchestrator::with_backend(
        FaultyStore::new(0, 1),
        scene_pipeline(outputs.path()),
        &job_config(1, 1),
    )
    .await?;

    let id = orchestrator.submit(ImageInput::path(&input)).await?;
    let status = orchestrator.wait(id, POLL, TIMEOUT).await;

    let JobStatus::Success(result) = &status else {
        panic!("expected success, got {:?}", status);
    };
    assert!(outputs.path().join(&result.output_image).is_file());
    assert_eq!(artifact_count(outputs.path()), 1);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unrecorded_success_fails_and_withdraws_artifact() -> anyhow::Result<()> {
    // 1. Both attempts to record success fail
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let orchestrator = Orchestrator::with_backend(
        FaultyStore::new(0, 2),
        scene_pipeline(outputs.path()),
        &job_config(1, 1),
    )
    .await?;

    // 2. The job fails rather than hanging in STARTED
    let id = orchestrator.submit(ImageInput::path(&input)).await?;
    let status = orchestrator.wait(id, POLL, TIMEOUT).await;
    assert!(
        matches!(&status, JobStatus::Failure(reason) if reason == INTERNAL_ERROR),
        "got {:?}",
        status
    );
    let record = orchestrator.store().load(id).await?.expect("job exists");
    assert_eq!(record.state, JobState::Failure);

    // 3. No artifact is left without a successful job
    assert_eq!(artifact_count(outputs.path()), 0);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cleanup_failed_keeps_only_recorded_artifacts() -> anyhow::Result<()> {
    // 1. One successful job
    let (inputs, outputs) = workspace();
    let input = write_scene(inputs.path(), "car.png");
    let orchestrator = Orchestrator::in_process(scene_pipeline(outputs.path()));
    let id = orchestrator.submit(ImageInput::path(&input)).await?;
    let JobStatus::Success(result) = orchestrator.status(id).await else {
        panic!("expected success");
    };

    // 2. Leftovers of a failed job and of an interrupted write
    let dir = outputs.path().join("redacted");
    std::fs::write(dir.join("orphan.png"), b"unreferenced")?;
    std::fs::write(
        dir.join(format!("{}x.png", platescrub::render::PARTIAL_PREFIX)),
        b"half",
    )?;

    // 3. Both leftovers go, the recorded artifact stays
    assert_eq!(orchestrator.cleanup_failed().await?, 2);
    assert_eq!(artifact_count(outputs.path()), 1);
    assert!(outputs.path().join(&result.output_image).is_file());
    assert_eq!(orchestrator.cleanup_failed().await?, 0);

    Ok(())
}
