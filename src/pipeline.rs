use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use image::{DynamicImage, ImageFormat, Rgb};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detection::object::ObjectDetector;
use crate::detection::plate_format::PlateClassifier;
use crate::detection::text::TextDetector;
use crate::detection::Detector;
use crate::errors::RedactError;
use crate::merge::{MergeConfig, merge_all};
use crate::models::{BoundingBox, CandidateRegion, RedactionResult, RedactionSet};
use crate::render::Renderer;
use crate::source::{ImageInput, SourceImage};

/// Where intermediate images are saved for inspection
#[derive(Clone, Debug)]
pub struct DebugConfig {
    pub output_dir: PathBuf,
}

/// Detect, merge and render: the full redaction of one image.
pub struct RedactionPipeline {
    detectors: Vec<Arc<dyn Detector>>,
    merge: MergeConfig,
    renderer: Renderer,
    debug: Option<DebugConfig>,
}

impl RedactionPipeline {
    /// Create a pipeline without detectors
    pub fn new(renderer: Renderer) -> Self {
        Self {
            detectors: Vec::new(),
            merge: MergeConfig::default(),
            renderer,
            debug: None,
        }
    }

    /// Text and object detectors plus renderer, all from `config`.
    pub fn from_config(config: &Config) -> Self {
        let classifier = PlateClassifier::new(&config.detection.deny_list);
        let text = match &config.detection.ocr_model_dir {
            Some(dir) => TextDetector::load(dir, config.detection.text_confidence, classifier),
            None => {
                warn!("No OCR model directory configured");
                TextDetector::unavailable(classifier)
            }
        };
        let object = ObjectDetector::load(
            config.detection.plate_model.as_deref(),
            config.detection.input_size,
            config.detection.object.clone(),
        );
        let renderer = Renderer::new(
            config.output_dir.clone(),
            config.output_prefix.clone(),
            config.render.clone(),
        );

        Self::new(renderer)
            .add_detector(Arc::new(text))
            .add_detector(Arc::new(object))
            .with_merge_config(config.merge.clone())
    }

    pub fn add_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn with_merge_config(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }

    /// Enable debug mode with output directory
    /// The directory must be empty or non-existent
    pub fn with_debug(mut self, output_dir: PathBuf) -> Result<Self> {
        if output_dir.exists() {
            let entries = std::fs::read_dir(&output_dir)?;
            if entries.count() > 0 {
                return Err(anyhow::anyhow!(
                    "Debug directory is not empty: {}",
                    output_dir.display()
                ));
            }
        } else {
            std::fs::create_dir_all(&output_dir)?;
        }

        self.debug = Some(DebugConfig { output_dir });
        Ok(self)
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// `name -> version` of every detector, available or not
    pub fn detector_versions(&self) -> BTreeMap<String, String> {
        self.detectors
            .iter()
            .map(|d| (d.name().to_string(), d.version()))
            .collect()
    }

    /// Run every available detector over `source` and merge the results.
    ///
    /// A detector that errors contributes no candidates. Fails only when no
    /// detector produced a result; an image must never be published as
    /// "redacted" without any detection having run.
    pub fn plan(&self, source: &SourceImage) -> Result<RedactionSet, RedactError> {
        let available: Vec<&Arc<dyn Detector>> =
            self.detectors.iter().filter(|d| d.is_available()).collect();
        if available.is_empty() {
            return Err(RedactError::DetectorUnavailable(
                "no detectors available".to_string(),
            ));
        }
        for detector in self.detectors.iter().filter(|d| !d.is_available()) {
            debug!("Skipping unavailable detector '{}'", detector.name());
        }

        let mut groups: Vec<(&str, Vec<CandidateRegion>)> = Vec::with_capacity(available.len());
        let mut failures = Vec::new();
        for detector in available {
            match detector.detect(source.image()) {
                Ok(candidates) => {
                    debug!(
                        "Detector '{}' found {} candidate(s) in {}",
                        detector.name(),
                        candidates.len(),
                        source.label()
                    );
                    groups.push((detector.name(), candidates));
                }
                Err(e) => {
                    // The other detectors still cover the image
                    warn!("Detector '{}' failed on {}: {}", detector.name(), source.label(), e);
                    failures.push(format!("{}: {}", detector.name(), e));
                }
            }
        }
        if groups.is_empty() {
            return Err(RedactError::DetectorUnavailable(format!(
                "every detector failed ({})",
                failures.join("; ")
            )));
        }

        let slices: Vec<&[CandidateRegion]> = groups.iter().map(|(_, c)| c.as_slice()).collect();
        let set = merge_all(&slices, &self.merge, source.width(), source.height());
        info!(
            "{}: {} candidate(s) merged into {} region(s)",
            source.label(),
            slices.iter().map(|s| s.len()).sum::<usize>(),
            set.len()
        );

        if let Some(debug_config) = &self.debug {
            if let Err(e) = save_debug_output(&debug_config.output_dir, source, &groups, &set) {
                warn!("Failed to save debug output: {}", e);
            }
        }

        Ok(set)
    }

    /// Redact `input` and write the artifact.
    pub fn run(&self, input: &ImageInput) -> Result<RedactionResult, RedactError> {
        input.validate()?;
        let source = SourceImage::load(input)?;
        let set = self.plan(&source)?;
        let result = self.renderer.render(&source, &set, &self.detector_versions())?;
        Ok(result)
    }

    /// Redact `input` in memory without writing anything.
    pub fn run_to_bytes(&self, input: &ImageInput) -> Result<(Vec<u8>, ImageFormat), RedactError> {
        input.validate()?;
        let source = SourceImage::load(input)?;
        let set = self.plan(&source)?;
        Ok(self.renderer.render_to_bytes(&source, &set)?)
    }
}

/// Layout, per source image (`<digest prefix>/`):
/// `00_input.png`, `01_<detector>/NN.png` candidate crops,
/// `02_accepted/NN.png` redacted areas, `03_overview.png` with all boxes drawn.
fn save_debug_output(
    root: &Path,
    source: &SourceImage,
    groups: &[(&str, Vec<CandidateRegion>)],
    set: &RedactionSet,
) -> Result<()> {
    let dir = root.join(&source.digest()[..16]);
    std::fs::create_dir_all(&dir)?;

    let image = source.image();
    image
        .save(dir.join("00_input.png"))
        .map_err(|e| anyhow::anyhow!("Failed to save debug input: {}", e))?;

    for (name, candidates) in groups {
        let step_dir = dir.join(format!("01_{}", name));
        std::fs::create_dir_all(&step_dir)?;
        for (idx, candidate) in candidates.iter().enumerate() {
            save_crop(image, &candidate.bbox, &step_dir.join(format!("{:02}.png", idx + 1)))?;
        }
    }

    let accepted_dir = dir.join("02_accepted");
    std::fs::create_dir_all(&accepted_dir)?;
    for (idx, region) in set.iter().enumerate() {
        save_crop(image, &region.area, &accepted_dir.join(format!("{:02}.png", idx + 1)))?;
    }

    let mut overview = image.to_rgb8();
    for (_, candidates) in groups {
        for candidate in candidates {
            draw_box(&mut overview, &candidate.bbox, Rgb([255, 200, 0]));
        }
    }
    for region in set.iter() {
        draw_box(&mut overview, &region.area, Rgb([255, 0, 0]));
    }
    overview
        .save(dir.join("03_overview.png"))
        .map_err(|e| anyhow::anyhow!("Failed to save debug overview: {}", e))?;

    debug!("Debug: saved {}", dir.display());
    Ok(())
}

fn save_crop(image: &DynamicImage, bbox: &BoundingBox, path: &Path) -> Result<()> {
    if let Some(crop) = bbox.crop(image) {
        crop.save(path)
            .map_err(|e| anyhow::anyhow!("Failed to save debug image: {}", e))?;
    }
    Ok(())
}

fn draw_box(canvas: &mut image::RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    if bbox.is_empty() {
        return;
    }
    let rect = Rect::at(bbox.x as i32, bbox.y as i32).of_size(bbox.width, bbox.height);
    draw_hollow_rect_mut(canvas, rect, color);
}
