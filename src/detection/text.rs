use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;
use tracing::{debug, warn};

use crate::detection::Detector;
use crate::detection::ocr::{OcrsRecognizer, TextRecognizer};
use crate::detection::plate_format::{PlateClassifier, PlateVerdict};
use crate::errors::{DetectorError, DetectorResult};
use crate::models::CandidateRegion;

/// Finds plates by reading text and keeping the spans that look like plates.
pub struct TextDetector {
    recognizer: Option<Arc<dyn TextRecognizer>>,
    classifier: PlateClassifier,
}

impl TextDetector {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, classifier: PlateClassifier) -> Self {
        Self {
            recognizer: Some(recognizer),
            classifier,
        }
    }

    /// Detector with no engine; reports itself unavailable.
    pub fn unavailable(classifier: PlateClassifier) -> Self {
        Self {
            recognizer: None,
            classifier,
        }
    }

    /// Load the `ocrs` engine from `model_dir`. A load failure is logged and yields
    /// an unavailable detector rather than an error.
    pub fn load(model_dir: &Path, confidence: f32, classifier: PlateClassifier) -> Self {
        match OcrsRecognizer::load(model_dir, confidence) {
            Ok(recognizer) => Self::new(Arc::new(recognizer), classifier),
            Err(e) => {
                warn!("Text detector unavailable: {}", e);
                Self::unavailable(classifier)
            }
        }
    }

    pub fn classifier(&self) -> &PlateClassifier {
        &self.classifier
    }
}

impl Detector for TextDetector {
    fn detect(&self, image: &DynamicImage) -> DetectorResult<Vec<CandidateRegion>> {
        let Some(recognizer) = &self.recognizer else {
            return Err(DetectorError::Unavailable("no OCR engine loaded".to_string()));
        };

        let spans = recognizer.recognize(image)?;
        let total = spans.len();
        let mut rejected = 0usize;
        let candidates: Vec<CandidateRegion> = spans
            .into_iter()
            .filter_map(|span| match self.classifier.classify(&span.text) {
                PlateVerdict::Plate(_) => {
                    Some(CandidateRegion::text(span.bbox, span.confidence, span.text))
                }
                PlateVerdict::Rejected(_) => {
                    rejected += 1;
                    None
                }
            })
            .collect();

        // Plate text itself is never logged
        debug!(
            "Text detector: {} span(s), {} plate-like, {} rejected",
            total,
            candidates.len(),
            rejected
        );
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "text"
    }

    fn version(&self) -> String {
        match &self.recognizer {
            Some(recognizer) => recognizer.version(),
            None => "unavailable".to_string(),
        }
    }

    fn is_available(&self) -> bool {
        self.recognizer.is_some()
    }
}
