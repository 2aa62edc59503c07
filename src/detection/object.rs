use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, RgbImage};
use rten::Model;
use rten_tensor::NdTensor;
use rten_tensor::prelude::*;
use tracing::{debug, info, warn};

use crate::detection::Detector;
use crate::detection::preprocessing::{letterbox, to_chw};
use crate::errors::{DetectorError, DetectorResult};
use crate::merge::suppress_overlaps;
use crate::models::CandidateRegion;
use crate::render::naming::content_digest;

/// One raw prediction in model-input pixel space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub score: f32,
}

/// A frozen plate-detection network taking a square RGB input.
pub trait PlateModel: Send + Sync {
    /// Raw predictions scoring at least `min_score`.
    fn infer(&self, input: &RgbImage, min_score: f32) -> DetectorResult<Vec<ModelBox>>;

    /// Edge length of the square input
    fn input_size(&self) -> u32;

    fn version(&self) -> String;
}

/// YOLO-style detector exported to the `rten` format
pub struct RtenPlateModel {
    model: Model,
    input_size: u32,
    version: String,
}

impl RtenPlateModel {
    pub fn load(path: &Path, input_size: u32) -> DetectorResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| DetectorError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let version = format!("rten-{}", &content_digest(&bytes)[..12]);
        let model = Model::load(bytes)
            .map_err(|e| DetectorError::Unavailable(format!("{}: {}", path.display(), e)))?;

        info!("Plate model loaded from {} ({})", path.display(), version);
        Ok(Self {
            model,
            input_size,
            version,
        })
    }
}

impl PlateModel for RtenPlateModel {
    fn infer(&self, input: &RgbImage, min_score: f32) -> DetectorResult<Vec<ModelBox>> {
        let size = self.input_size as usize;
        let tensor = NdTensor::from_data([1, 3, size, size], to_chw(input));
        let output = self
            .model
            .run_one(tensor.view().into(), None)
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let output: NdTensor<f32, 3> = output
            .try_into()
            .map_err(|e| DetectorError::Inference(format!("unexpected model output: {}", e)))?;

        let [_, rows, cols] = output.shape();
        decode_predictions(&output.to_vec(), rows, cols, min_score)
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}

/// Decode a `[rows, cols]` YOLO head: either `[4 + classes, anchors]` or its transpose.
/// The score of an anchor is its best class score.
pub fn decode_predictions(
    data: &[f32],
    rows: usize,
    cols: usize,
    min_score: f32,
) -> DetectorResult<Vec<ModelBox>> {
    if data.len() != rows * cols {
        return Err(DetectorError::Inference(format!(
            "output has {} values, expected {}x{}",
            data.len(),
            rows,
            cols
        )));
    }
    // Anchors always outnumber channels
    let channels_first = rows <= cols;
    let (channels, anchors) = if channels_first { (rows, cols) } else { (cols, rows) };
    if channels < 5 {
        return Err(DetectorError::Inference(format!(
            "output has {} channels, expected at least 5",
            channels
        )));
    }

    let at = |channel: usize, anchor: usize| {
        if channels_first {
            data[channel * anchors + anchor]
        } else {
            data[anchor * channels + channel]
        }
    };

    let mut boxes = Vec::new();
    for anchor in 0..anchors {
        let score = (4..channels)
            .map(|c| at(c, anchor))
            .fold(f32::NEG_INFINITY, f32::max);
        if score.is_nan() || score < min_score {
            continue;
        }
        boxes.push(ModelBox {
            cx: at(0, anchor),
            cy: at(1, anchor),
            w: at(2, anchor),
            h: at(3, anchor),
            score,
        });
    }
    Ok(boxes)
}

/// Object-detector settings
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDetectorConfig {
    pub min_confidence: f32,
    pub nms_iou: f32,
    /// Boxes covering more of the image than this are discarded
    pub max_area_fraction: f32,
}

impl Default for ObjectDetectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            nms_iou: 0.5,
            max_area_fraction: 0.35,
        }
    }
}

/// Finds plates with a trained detector. Without a model it returns no candidates.
pub struct ObjectDetector {
    model: Option<Arc<dyn PlateModel>>,
    config: ObjectDetectorConfig,
}

impl ObjectDetector {
    pub fn new(model: Arc<dyn PlateModel>, config: ObjectDetectorConfig) -> Self {
        Self {
            model: Some(model),
            config,
        }
    }

    pub fn unavailable(config: ObjectDetectorConfig) -> Self {
        Self { model: None, config }
    }

    /// Load the model at `path`. A missing path or a failed load degrades to an
    /// unavailable detector.
    pub fn load(path: Option<&Path>, input_size: u32, config: ObjectDetectorConfig) -> Self {
        let Some(path) = path else {
            info!("No plate model configured; object detector disabled");
            return Self::unavailable(config);
        };
        match RtenPlateModel::load(path, input_size) {
            Ok(model) => Self::new(Arc::new(model), config),
            Err(e) => {
                warn!("Object detector unavailable: {}", e);
                Self::unavailable(config)
            }
        }
    }

    fn run(&self, model: &dyn PlateModel, image: &DynamicImage) -> DetectorResult<Vec<CandidateRegion>> {
        let (width, height) = (image.width(), image.height());
        let (input, lb) = letterbox(image, model.input_size());
        let raw = model.infer(&input, self.config.min_confidence)?;
        let raw_count = raw.len();

        let candidates: Vec<CandidateRegion> = raw
            .into_iter()
            .filter(|b| b.score >= self.config.min_confidence)
            .filter_map(|b| {
                let bbox = lb.to_source(b.cx, b.cy, b.w, b.h, width, height)?;
                if bbox.area_fraction(width, height) > self.config.max_area_fraction {
                    return None;
                }
                Some(CandidateRegion::object(bbox, b.score))
            })
            .collect();

        let kept = suppress_overlaps(candidates, self.config.nms_iou, |c| c.confidence);
        debug!("Object detector: {} raw box(es), {} kept", raw_count, kept.len());
        Ok(kept)
    }
}

impl Detector for ObjectDetector {
    fn detect(&self, image: &DynamicImage) -> DetectorResult<Vec<CandidateRegion>> {
        let Some(model) = &self.model else {
            return Ok(Vec::new());
        };
        // Inference errors go to the pipeline, which falls back to the other detectors
        self.run(model.as_ref(), image)
    }

    fn name(&self) -> &str {
        "object"
    }

    fn version(&self) -> String {
        match &self.model {
            Some(model) => model.version(),
            None => "unavailable".to_string(),
        }
    }

    fn is_available(&self) -> bool {
        self.model.is_some()
    }
}
