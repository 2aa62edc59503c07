#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from platescrub for tests
pub use platescrub::core::db::{JobStore, MemoryJobStore, SqliteJobStore};
pub use platescrub::jobs::{JobRecord, JobState};
pub use platescrub::{
    BatchState, BoundingBox, CandidateRegion, CandidateSource, ImageInput, JobId, JobStatus,
    Orchestrator, RedactError, RedactionPipeline, RedactionSet, SourceImage,
};
