// Error types for the redaction pipeline and job orchestration.
//
// Detector errors are recovered inside the pipeline, render errors fail a job,
// store errors surface as an UNAVAILABLE status, and invalid input is rejected
// before anything is enqueued.

use thiserror::Error;

/// Detector-level failures
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Renderer failures (unreadable, zero-size or unsupported images, write errors)
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read source image {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("image has zero size ({width}x{height})")]
    ZeroSize { width: u32, height: u32 },

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to clean up {path}: {source}")]
    Cleanup {
        path: String,
        source: std::io::Error,
    },
}

/// Job store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job backend unreachable: {0}")]
    Unreachable(String),

    #[error("corrupt job record: {0}")]
    Corrupt(String),

    #[error("job {job_id} cannot move to {to}")]
    InvalidTransition { job_id: String, to: &'static str },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt(err.to_string()),
            other => StoreError::Unreachable(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unreachable(format!("migration failed: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Top-level error taxonomy seen by callers of the pipeline and orchestrator
#[derive(Debug, Error)]
pub enum RedactError {
    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("render failure: {0}")]
    RenderFailure(#[from] RenderError),

    #[error("job backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RedactError {
    /// Stable, caller-facing reason code. Never carries error internals.
    pub fn public_reason(&self) -> &'static str {
        match self {
            RedactError::DetectorUnavailable(_) => "detector_unavailable",
            RedactError::RenderFailure(_) => "render_failed",
            RedactError::BackendUnreachable(_) => "jobs_backend_unavailable",
            RedactError::InvalidInput(_) => "invalid_input",
        }
    }
}

impl From<StoreError> for RedactError {
    fn from(err: StoreError) -> Self {
        RedactError::BackendUnreachable(err.to_string())
    }
}

impl From<DetectorError> for RedactError {
    fn from(err: DetectorError) -> Self {
        RedactError::DetectorUnavailable(err.to_string())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be in [0.0, 1.0], got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("environment variable {name} could not be parsed: {value:?}")]
    EnvVarError { name: String, value: String },
}

pub type RenderResult<T> = Result<T, RenderError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type DetectorResult<T> = Result<T, DetectorError>;
