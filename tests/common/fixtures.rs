use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

use platescrub::detection::object::{ModelBox, ObjectDetectorConfig};
use platescrub::detection::{
    ObjectDetector, PlateClassifier, PlateModel, RecognizedSpan, TextDetector, TextRecognizer,
};
use platescrub::core::db::{JobStore, MemoryJobStore};
use platescrub::errors::{DetectorError, DetectorResult, StoreError, StoreResult};
use platescrub::jobs::{BatchId, JobId, JobRecord};
use platescrub::{
    BoundingBox, CandidateRegion, Detector, RedactionPipeline, RedactionResult, RenderConfig,
    Renderer,
};

pub const SCENE_WIDTH: u32 = 320;
pub const SCENE_HEIGHT: u32 = 200;

/// Where the "LE75 CFG" plate sits in the scene
pub const PLATE: BoundingBox = BoundingBox { x: 40, y: 140, width: 120, height: 24 };
/// The "KIA" badge
pub const MAKE_BADGE: BoundingBox = BoundingBox { x: 120, y: 40, width: 60, height: 24 };
/// The "EV9" model badge
pub const MODEL_BADGE: BoundingBox = BoundingBox { x: 200, y: 40, width: 40, height: 20 };

fn inside(b: &BoundingBox, x: u32, y: u32) -> bool {
    x >= b.x && x < b.right() && y >= b.y && y < b.bottom()
}

/// A 320x200 "car": smooth background with high-contrast stripes where the plate
/// and both badges are, so pixelation visibly changes them.
pub fn scene_image() -> RgbImage {
    RgbImage::from_fn(SCENE_WIDTH, SCENE_HEIGHT, |x, y| {
        if [PLATE, MAKE_BADGE, MODEL_BADGE].iter().any(|b| inside(b, x, y)) {
            if x % 2 == 0 { Rgb([12, 12, 12]) } else { Rgb([240, 240, 240]) }
        } else {
            Rgb([(x / 4) as u8 + 40, (y / 4) as u8 + 60, 128])
        }
    })
}

/// Save the scene as PNG under `dir` and return its path.
pub fn write_scene(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    scene_image()
        .save_with_format(&path, ImageFormat::Png)
        .expect("Failed to save scene image");
    path
}

/// A non-empty file that is not an image.
pub fn write_corrupt(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"this is definitely not an image").expect("Failed to write file");
    path
}

pub fn scene_png_bytes() -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(scene_image())
        .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("Failed to encode scene");
    bytes
}

/// Recognizer that "reads" the plate and both badges of the scene.
pub struct FakeRecognizer {
    spans: Vec<RecognizedSpan>,
}

impl FakeRecognizer {
    pub fn scene() -> Self {
        let span = |bbox, text: &str| RecognizedSpan {
            bbox,
            text: text.to_string(),
            confidence: 0.9,
        };
        Self {
            spans: vec![
                span(PLATE, "LE75 CFG"),
                span(MAKE_BADGE, "KIA"),
                span(MODEL_BADGE, "EV9"),
            ],
        }
    }
}

impl TextRecognizer for FakeRecognizer {
    fn recognize(&self, _image: &DynamicImage) -> DetectorResult<Vec<RecognizedSpan>> {
        Ok(self.spans.clone())
    }

    fn version(&self) -> String {
        "fake-ocr-1".to_string()
    }
}

/// Recognizer whose engine always errors.
pub struct FailingRecognizer;

impl TextRecognizer for FailingRecognizer {
    fn recognize(&self, _image: &DynamicImage) -> DetectorResult<Vec<RecognizedSpan>> {
        Err(DetectorError::Inference("engine crashed".to_string()))
    }

    fn version(&self) -> String {
        "failing-ocr-1".to_string()
    }
}

/// Plate model that finds the scene's plate.
///
/// The input is the scene letterboxed into a 320x320 square: scale 1, 60px of
/// padding above, so boxes are the source boxes shifted down by 60.
pub struct FakePlateModel;

impl PlateModel for FakePlateModel {
    fn infer(&self, _input: &RgbImage, min_score: f32) -> DetectorResult<Vec<ModelBox>> {
        let pad_y = ((SCENE_WIDTH - SCENE_HEIGHT) / 2) as f32;
        let plate = ModelBox {
            cx: PLATE.x as f32 + PLATE.width as f32 / 2.0,
            cy: PLATE.y as f32 + PLATE.height as f32 / 2.0 + pad_y,
            w: PLATE.width as f32,
            h: PLATE.height as f32,
            score: 0.85,
        };
        Ok(vec![plate].into_iter().filter(|b| b.score >= min_score).collect())
    }

    fn input_size(&self) -> u32 {
        SCENE_WIDTH
    }

    fn version(&self) -> String {
        "fake-plates-1".to_string()
    }
}

/// Plate model whose inference always errors.
pub struct BrokenPlateModel;

impl PlateModel for BrokenPlateModel {
    fn infer(&self, _input: &RgbImage, _min_score: f32) -> DetectorResult<Vec<ModelBox>> {
        Err(DetectorError::Inference("tensor shape mismatch".to_string()))
    }

    fn input_size(&self) -> u32 {
        SCENE_WIDTH
    }

    fn version(&self) -> String {
        "broken-1".to_string()
    }
}

/// Detector that fails its first `failures` calls, then finds nothing.
pub struct FlakyDetector {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyDetector {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Detector for FlakyDetector {
    fn detect(&self, _image: &DynamicImage) -> DetectorResult<Vec<CandidateRegion>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(DetectorError::Inference("transient".to_string()));
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "flaky"
    }

    fn version(&self) -> String {
        "flaky-1".to_string()
    }
}

pub fn text_detector() -> Arc<TextDetector> {
    Arc::new(TextDetector::new(
        Arc::new(FakeRecognizer::scene()),
        PlateClassifier::default(),
    ))
}

pub fn object_detector() -> Arc<ObjectDetector> {
    Arc::new(ObjectDetector::new(
        Arc::new(FakePlateModel),
        ObjectDetectorConfig::default(),
    ))
}

pub fn renderer(output_dir: &Path) -> Renderer {
    Renderer::new(output_dir, "redacted", RenderConfig::default())
}

/// Pipeline with both fake detectors writing under `output_dir`.
pub fn scene_pipeline(output_dir: &Path) -> RedactionPipeline {
    RedactionPipeline::new(renderer(output_dir))
        .add_detector(text_detector())
        .add_detector(object_detector())
}

/// Separate temp directories for inputs and artifacts.
pub fn workspace() -> (TempDir, TempDir) {
    let inputs = TempDir::new().expect("Failed to create input directory");
    let outputs = TempDir::new().expect("Failed to create output directory");
    (inputs, outputs)
}

/// Number of finished artifacts (temp files excluded) under `output_dir`.
pub fn artifact_count(output_dir: &Path) -> usize {
    let dir = output_dir.join("redacted");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|name| !name.starts_with(platescrub::render::PARTIAL_PREFIX))
                .unwrap_or(false)
        })
        .count()
}

/// True when every pixel of `area` is the same in both images.
pub fn same_pixels(a: &RgbImage, b: &RgbImage, area: BoundingBox) -> bool {
    (area.y..area.bottom()).all(|y| (area.x..area.right()).all(|x| a.get_pixel(x, y) == b.get_pixel(x, y)))
}

/// In-memory job store whose first writes of a kind fail as if the backend dropped out.
pub struct FaultyStore {
    inner: MemoryJobStore,
    start_failures: AtomicUsize,
    success_failures: AtomicUsize,
}

impl FaultyStore {
    pub fn new(start_failures: usize, success_failures: usize) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            start_failures: AtomicUsize::new(start_failures),
            success_failures: AtomicUsize::new(success_failures),
        }
    }

    fn trip(counter: &AtomicUsize) -> StoreResult<()> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StoreError::Unreachable("connection reset".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl JobStore for FaultyStore {
    async fn insert(&self, jobs: &[JobRecord]) -> StoreResult<()> {
        self.inner.insert(jobs).await
    }

    async fn load(&self, id: JobId) -> StoreResult<Option<JobRecord>> {
        self.inner.load(id).await
    }

    async fn load_batch(&self, batch_id: BatchId) -> StoreResult<Vec<JobRecord>> {
        self.inner.load_batch(batch_id).await
    }

    async fn mark_started(&self, id: JobId) -> StoreResult<u32> {
        Self::trip(&self.start_failures)?;
        self.inner.mark_started(id).await
    }

    async fn mark_success(&self, id: JobId, result: &RedactionResult) -> StoreResult<()> {
        Self::trip(&self.success_failures)?;
        self.inner.mark_success(id, result).await
    }

    async fn mark_failure(&self, id: JobId, reason: &str) -> StoreResult<()> {
        self.inner.mark_failure(id, reason).await
    }

    async fn fail_incomplete(&self, reason: &str) -> StoreResult<u64> {
        self.inner.fail_incomplete(reason).await
    }

    async fn succeeded_artifacts(&self) -> StoreResult<HashSet<String>> {
        self.inner.succeeded_artifacts().await
    }

    async fn count(&self) -> StoreResult<u64> {
        self.inner.count().await
    }
}
