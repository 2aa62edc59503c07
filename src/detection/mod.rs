pub mod object;
pub mod ocr;
pub mod plate_format;
pub mod preprocessing;
pub mod text;

use image::DynamicImage;

use crate::errors::DetectorResult;
use crate::models::CandidateRegion;

pub use object::{ObjectDetector, PlateModel, RtenPlateModel};
pub use ocr::{OcrsRecognizer, RecognizedSpan, TextRecognizer};
pub use plate_format::{PlateClassifier, PlateVerdict};
pub use text::TextDetector;

/// A source of plate candidates.
///
/// Detectors are shared across worker threads and must be immutable once built.
pub trait Detector: Send + Sync {
    /// Find candidate regions in `image`. An image without plates yields an empty list.
    fn detect(&self, image: &DynamicImage) -> DetectorResult<Vec<CandidateRegion>>;

    /// Short stable name, used as the key in detector version maps
    fn name(&self) -> &str;

    /// Identifies the model/rules in use; changes whenever output could change.
    fn version(&self) -> String;

    /// `false` when the detector could not load its model and will only ever
    /// return empty results.
    fn is_available(&self) -> bool {
        true
    }
}
