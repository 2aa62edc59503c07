pub mod config;
pub mod core;
pub mod detection;
pub mod errors;
pub mod jobs;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod render;
pub mod source;

pub use config::Config;
pub use detection::Detector;
pub use errors::{ConfigError, DetectorError, RedactError, RenderError, StoreError};
pub use jobs::{BatchId, BatchState, JobId, JobStatus, Orchestrator};
pub use merge::{MergeConfig, merge, merge_all};
pub use models::{BoundingBox, CandidateRegion, CandidateSource, RedactionResult, RedactionSet};
pub use pipeline::RedactionPipeline;
pub use render::{RenderConfig, Renderer};
pub use source::{ImageInput, SourceImage};
