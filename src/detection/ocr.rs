use std::path::{Path, PathBuf};

use image::DynamicImage;
use ocrs::{ImageSource, OcrEngine, OcrEngineParams, TextItem};
use rten::Model;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::{DetectorError, DetectorResult};
use crate::models::BoundingBox;

pub const DETECTION_MODEL_FILE: &str = "text-detection.rten";
pub const RECOGNITION_MODEL_FILE: &str = "text-recognition.rten";

/// One recognised line of text
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedSpan {
    pub bbox: BoundingBox,
    pub text: String,
    pub confidence: f32,
}

/// Text recognition engine: finds and reads text lines in a whole image.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &DynamicImage) -> DetectorResult<Vec<RecognizedSpan>>;

    fn version(&self) -> String;
}

/// Default model location used by `ocrs-cli`
pub fn default_model_dir() -> Option<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()?;
    Some(Path::new(&home).join(".cache/ocrs"))
}

/// `ocrs` engine with models loaded from disk
pub struct OcrsRecognizer {
    engine: OcrEngine,
    confidence: f32,
    version: String,
}

impl OcrsRecognizer {
    /// Load detection and recognition models from `model_dir`.
    ///
    /// `ocrs` does not score lines, so every span is reported with `confidence`.
    pub fn load(model_dir: &Path, confidence: f32) -> DetectorResult<Self> {
        let detection_model_path = model_dir.join(DETECTION_MODEL_FILE);
        let recognition_model_path = model_dir.join(RECOGNITION_MODEL_FILE);

        if !detection_model_path.exists() || !recognition_model_path.exists() {
            return Err(DetectorError::Unavailable(format!(
                "OCR models not found. Expected locations:\n  - {}\n  - {}",
                detection_model_path.display(),
                recognition_model_path.display()
            )));
        }

        let version = model_version(&[&detection_model_path, &recognition_model_path])?;

        let detection_model = Model::load_file(&detection_model_path)
            .map_err(|e| DetectorError::Unavailable(format!("text detection model: {}", e)))?;
        let recognition_model = Model::load_file(&recognition_model_path)
            .map_err(|e| DetectorError::Unavailable(format!("text recognition model: {}", e)))?;

        let engine = OcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            ..Default::default()
        })
        .map_err(|e| DetectorError::Unavailable(e.to_string()))?;

        info!("OCR engine loaded from {} ({})", model_dir.display(), version);

        Ok(Self {
            engine,
            confidence: confidence.clamp(0.0, 1.0),
            version,
        })
    }
}

impl TextRecognizer for OcrsRecognizer {
    fn recognize(&self, image: &DynamicImage) -> DetectorResult<Vec<RecognizedSpan>> {
        let img = image.to_rgb8();
        let img_source = ImageSource::from_bytes(img.as_raw(), img.dimensions())
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let ocr_input = self
            .engine
            .prepare_input(img_source)
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let words = self
            .engine
            .detect_words(&ocr_input)
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let lines = self.engine.find_text_lines(&ocr_input, &words);
        let recognized = self
            .engine
            .recognize_text(&ocr_input, &lines)
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let spans: Vec<RecognizedSpan> = recognized
            .into_iter()
            .flatten()
            .filter_map(|line| {
                let text = line.to_string().trim().to_string();
                if text.is_empty() {
                    return None;
                }
                let rect = line.bounding_rect();
                let bbox = BoundingBox::from_corners(
                    rect.left() as f32,
                    rect.top() as f32,
                    rect.right() as f32,
                    rect.bottom() as f32,
                )?;
                Some(RecognizedSpan {
                    bbox,
                    text,
                    confidence: self.confidence,
                })
            })
            .collect();

        debug!("OCR found {} words in {} text lines", words.len(), spans.len());
        Ok(spans)
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}

/// `ocrs-<hash of the model files>`
fn model_version(paths: &[&Path]) -> DetectorResult<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        let bytes = std::fs::read(path)
            .map_err(|e| DetectorError::Unavailable(format!("{}: {}", path.display(), e)))?;
        hasher.update(&bytes);
    }
    let digest = hex::encode(hasher.finalize());
    Ok(format!("ocrs-{}", &digest[..12]))
}
