use std::path::PathBuf;
use std::str::FromStr;

use crate::detection::object::ObjectDetectorConfig;
use crate::detection::ocr::default_model_dir;
use crate::detection::plate_format::DEFAULT_DENY_LIST;
use crate::errors::ConfigError;
use crate::merge::MergeConfig;
use crate::render::RenderConfig;

const ENV_PREFIX: &str = "PLATESCRUB_";

/// Detector configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    /// Directory holding the `ocrs` detection and recognition models
    pub ocr_model_dir: Option<PathBuf>,
    /// Confidence reported for every recognised text line
    pub text_confidence: f32,
    pub deny_list: Vec<String>,
    /// Frozen plate detector; `None` disables the object detector
    pub plate_model: Option<PathBuf>,
    pub input_size: u32,
    pub object: ObjectDetectorConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            ocr_model_dir: default_model_dir(),
            text_confidence: 0.9,
            deny_list: DEFAULT_DENY_LIST.iter().map(|s| s.to_string()).collect(),
            plate_model: None,
            input_size: 640,
            object: ObjectDetectorConfig::default(),
        }
    }
}

/// Job orchestration configuration
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// SQLite job database. Without one the orchestrator runs jobs in-process.
    pub database: Option<PathBuf>,
    pub workers: usize,
    /// Total runs of a job before it is marked failed
    pub max_attempts: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            database: None,
            workers: 4,
            max_attempts: 1,
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub detection: DetectionConfig,
    pub merge: MergeConfig,
    pub render: RenderConfig,
    pub jobs: JobConfig,
    /// Base directory artifacts are written under
    pub output_dir: PathBuf,
    /// Sub-path of `output_dir` holding the artifacts
    pub output_prefix: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detection: DetectionConfig::default(),
            merge: MergeConfig::default(),
            render: RenderConfig::default(),
            jobs: JobConfig::default(),
            output_dir: PathBuf::from("output"),
            output_prefix: PathBuf::from("redacted"),
        }
    }
}

impl Config {
    /// Build from `PLATESCRUB_*` environment variables over the defaults, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Config::default();

        let config = Config {
            detection: DetectionConfig {
                ocr_model_dir: env.path("OCR_MODEL_DIR").or(defaults.detection.ocr_model_dir),
                text_confidence: env
                    .parse("TEXT_CONFIDENCE")?
                    .unwrap_or(defaults.detection.text_confidence),
                deny_list: env
                    .get("DENY_LIST")
                    .map(|list| {
                        list.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or(defaults.detection.deny_list),
                plate_model: env.path("PLATE_MODEL"),
                input_size: env.parse("INPUT_SIZE")?.unwrap_or(defaults.detection.input_size),
                object: ObjectDetectorConfig {
                    min_confidence: env
                        .parse("MIN_CONFIDENCE")?
                        .unwrap_or(defaults.detection.object.min_confidence),
                    nms_iou: env
                        .parse("NMS_IOU")?
                        .unwrap_or(defaults.detection.object.nms_iou),
                    max_area_fraction: env
                        .parse("MAX_AREA_FRACTION")?
                        .unwrap_or(defaults.detection.object.max_area_fraction),
                },
            },
            merge: MergeConfig {
                iou_threshold: env.parse("MERGE_IOU")?.unwrap_or(defaults.merge.iou_threshold),
                object_bonus: env.parse("OBJECT_BONUS")?.unwrap_or(defaults.merge.object_bonus),
                margin: env.parse("MARGIN")?.unwrap_or(defaults.merge.margin),
            },
            render: RenderConfig {
                block_size: env.parse("BLOCK_SIZE")?.unwrap_or(defaults.render.block_size),
                jpeg_quality: env.parse("JPEG_QUALITY")?.unwrap_or(defaults.render.jpeg_quality),
                // 0 disables downscaling
                max_dimension: match env.parse::<u32>("MAX_DIMENSION")? {
                    Some(0) => None,
                    Some(max) => Some(max),
                    None => defaults.render.max_dimension,
                },
            },
            jobs: JobConfig {
                database: env.path("JOB_DB"),
                workers: env.parse("WORKERS")?.unwrap_or(defaults.jobs.workers),
                max_attempts: env.parse("MAX_ATTEMPTS")?.unwrap_or(defaults.jobs.max_attempts),
            },
            output_dir: env.path("OUTPUT_DIR").unwrap_or(defaults.output_dir),
            output_prefix: env.path("OUTPUT_PREFIX").unwrap_or(defaults.output_prefix),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_range("text_confidence", self.detection.text_confidence)?;
        unit_range("min_confidence", self.detection.object.min_confidence)?;
        unit_range("nms_iou", self.detection.object.nms_iou)?;
        unit_range("max_area_fraction", self.detection.object.max_area_fraction)?;
        unit_range("merge_iou", self.merge.iou_threshold)?;
        unit_range("object_bonus", self.merge.object_bonus)?;

        if !(0.0..=0.5).contains(&self.merge.margin) {
            return Err(ConfigError::InvalidValue {
                name: "margin",
                reason: format!("must be between 0.0 and 0.5, got {}", self.merge.margin),
            });
        }

        if !(32..=4096).contains(&self.detection.input_size) || self.detection.input_size % 32 != 0 {
            return Err(ConfigError::InvalidValue {
                name: "input_size",
                reason: format!(
                    "must be a multiple of 32 between 32 and 4096, got {}",
                    self.detection.input_size
                ),
            });
        }

        if self.render.block_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "block_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(1..=100).contains(&self.render.jpeg_quality) {
            return Err(ConfigError::InvalidValue {
                name: "jpeg_quality",
                reason: format!("must be between 1 and 100, got {}", self.render.jpeg_quality),
            });
        }
        if self.render.max_dimension == Some(0) {
            return Err(ConfigError::InvalidValue {
                name: "max_dimension",
                reason: "must be positive".to_string(),
            });
        }

        if self.jobs.workers == 0 {
            return Err(ConfigError::InvalidValue {
                name: "workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.jobs.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

fn unit_range(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { name, value })
    }
}

/// Prefixed, trimmed variable lookup. Empty values count as unset.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(&format!("{}{}", ENV_PREFIX, key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| ConfigError::EnvVarError {
                name: format!("{}{}", ENV_PREFIX, key),
                value,
            }),
        }
    }
}
