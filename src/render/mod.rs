pub mod naming;

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, ImageFormat, Pixel};
use tracing::{debug, info};

use crate::errors::{RenderError, RenderResult};
use crate::models::{BoundingBox, RedactionResult, RedactionSet};
use crate::source::SourceImage;

/// Prefix of in-flight temp files; anything carrying it is never a finished artifact.
pub const PARTIAL_PREFIX: &str = ".partial-";

/// Rendering parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Edge length of a pixelation cell
    pub block_size: u32,
    pub jpeg_quality: u8,
    /// Outputs larger than this on either side are downscaled after redaction.
    /// Off by default: downscaling alters pixels outside the redacted regions.
    pub max_dimension: Option<u32>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            block_size: 12,
            jpeg_quality: 92,
            max_dimension: None,
        }
    }
}

impl RenderConfig {
    /// Canonical description of the settings, folded into the version tag.
    fn settings_key(&self) -> String {
        format!(
            "block={};jpeg={};max={}",
            self.block_size,
            self.jpeg_quality,
            self.max_dimension.map(|d| d.to_string()).unwrap_or_else(|| "none".to_string())
        )
    }
}

/// Writes redacted copies of source images under a base directory.
#[derive(Debug, Clone)]
pub struct Renderer {
    config: RenderConfig,
    base_dir: PathBuf,
    prefix: PathBuf,
}

impl Renderer {
    /// `prefix` is the sub-path under `base_dir` artifacts are written to; returned
    /// artifact paths are relative to `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, prefix: impl Into<PathBuf>, config: RenderConfig) -> Self {
        Self {
            config,
            base_dir: base_dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Relative path the artifact for `source` will be written to.
    pub fn artifact_path(
        &self,
        source: &SourceImage,
        detector_versions: &BTreeMap<String, String>,
    ) -> RenderResult<PathBuf> {
        let format = output_format(source.format())?;
        let tag = naming::version_tag(&self.config.settings_key(), detector_versions);
        let name = naming::output_name(source.digest(), &tag, extension(format));
        Ok(self.prefix.join(name))
    }

    /// Obfuscate every region in `set` and return the encoded image.
    /// The source is never touched.
    pub fn render_to_bytes(
        &self,
        source: &SourceImage,
        set: &RedactionSet,
    ) -> RenderResult<(Vec<u8>, ImageFormat)> {
        let format = output_format(source.format())?;
        let redacted = self.redact(source.image(), set);
        let resized = match self.config.max_dimension {
            Some(max) if redacted.width() > max || redacted.height() > max => {
                debug!(
                    "Downscaling {}x{} output to fit {}px",
                    redacted.width(),
                    redacted.height(),
                    max
                );
                redacted.resize(max, max, FilterType::Lanczos3)
            }
            _ => redacted,
        };
        let bytes = encode(&resized, format, self.config.jpeg_quality)?;
        Ok((bytes, format))
    }

    /// Render and atomically publish the artifact under its deterministic name.
    pub fn render(
        &self,
        source: &SourceImage,
        set: &RedactionSet,
        detector_versions: &BTreeMap<String, String>,
    ) -> RenderResult<RedactionResult> {
        let relative = self.artifact_path(source, detector_versions)?;
        let (bytes, _format) = self.render_to_bytes(source, set)?;
        let destination = self.base_dir.join(&relative);
        write_atomic(&destination, &bytes)?;

        info!(
            "Rendered {} with {} redacted region(s) -> {}",
            source.label(),
            set.len(),
            relative.display()
        );

        Ok(RedactionResult {
            source_image: source.label().to_string(),
            output_image: relative_string(&relative),
            regions_redacted: set.len(),
            detector_versions: detector_versions.clone(),
        })
    }

    /// Remove leftover temp files from interrupted writes. Returns how many were deleted.
    pub fn cleanup_partial(&self) -> std::io::Result<usize> {
        let dir = self.base_dir.join(&self.prefix);
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let is_partial = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(PARTIAL_PREFIX))
                .unwrap_or(false);
            if is_partial && entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Relative paths of every finished artifact under the prefix.
    pub fn artifacts(&self) -> RenderResult<Vec<String>> {
        let dir = self.base_dir.join(&self.prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let list_err = |source: std::io::Error| RenderError::Cleanup {
            path: dir.display().to_string(),
            source,
        };
        let mut artifacts = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            if !entry.file_type().map_err(list_err)?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(PARTIAL_PREFIX) {
                artifacts.push(relative_string(&self.prefix.join(name)));
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }

    /// Withdraw a published artifact. Returns false if it was already gone.
    pub fn remove_artifact(&self, relative: &str) -> RenderResult<bool> {
        let path = self.base_dir.join(relative);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Withdrew artifact {}", relative);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(RenderError::Cleanup {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn redact(&self, image: &DynamicImage, set: &RedactionSet) -> DynamicImage {
        if set.is_empty() {
            return image.clone();
        }
        let block = self.config.block_size.max(1);
        let (width, height) = (image.width(), image.height());
        let areas: Vec<BoundingBox> = set
            .iter()
            .filter_map(|region| region.area.clamp(width, height))
            .collect();

        if image.color().has_alpha() {
            let mut buf = image.to_rgba8();
            for area in &areas {
                pixelate(&mut buf, *area, block);
            }
            DynamicImage::ImageRgba8(buf)
        } else {
            let mut buf = image.to_rgb8();
            for area in &areas {
                pixelate(&mut buf, *area, block);
            }
            DynamicImage::ImageRgb8(buf)
        }
    }
}

/// Replace each `block`x`block` cell of `area` with the cell's mean colour.
/// Everything below cell resolution is discarded.
pub fn pixelate<P>(buf: &mut ImageBuffer<P, Vec<u8>>, area: BoundingBox, block: u32)
where
    P: Pixel<Subpixel = u8>,
{
    let Some(area) = area.clamp(buf.width(), buf.height()) else {
        return;
    };
    let block = block.max(1);
    let channels = P::CHANNEL_COUNT as usize;

    for cell_y in (area.y..area.bottom()).step_by(block as usize) {
        let y_end = (cell_y + block).min(area.bottom());
        for cell_x in (area.x..area.right()).step_by(block as usize) {
            let x_end = (cell_x + block).min(area.right());

            let mut sums = [0u64; 4];
            let mut count = 0u64;
            for y in cell_y..y_end {
                for x in cell_x..x_end {
                    for (i, c) in buf.get_pixel(x, y).channels().iter().enumerate().take(channels) {
                        sums[i] += *c as u64;
                    }
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }

            let mut mean = *buf.get_pixel(cell_x, cell_y);
            for (i, c) in mean.channels_mut().iter_mut().enumerate().take(channels) {
                *c = ((sums[i] + count / 2) / count) as u8;
            }
            for y in cell_y..y_end {
                for x in cell_x..x_end {
                    buf.put_pixel(x, y, mean);
                }
            }
        }
    }
}

/// Output keeps the source container for common web formats, PNG otherwise.
fn output_format(source: Option<ImageFormat>) -> RenderResult<ImageFormat> {
    match source {
        Some(ImageFormat::Jpeg) => Ok(ImageFormat::Jpeg),
        Some(ImageFormat::WebP) => Ok(ImageFormat::WebP),
        Some(_) => Ok(ImageFormat::Png),
        None => Err(RenderError::UnsupportedFormat("unknown source format".to_string())),
    }
}

fn extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::WebP => "webp",
        _ => "png",
    }
}

fn encode(image: &DynamicImage, format: ImageFormat, jpeg_quality: u8) -> RenderResult<Vec<u8>> {
    let mut out = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            // JPEG cannot store alpha
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut out, jpeg_quality);
            rgb.write_with_encoder(encoder).map_err(RenderError::Encode)?;
        }
        ImageFormat::WebP => {
            let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
            rgba.write_to(&mut Cursor::new(&mut out), ImageFormat::WebP)
                .map_err(RenderError::Encode)?;
        }
        _ => {
            image
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .map_err(RenderError::Encode)?;
        }
    }
    Ok(out)
}

/// Write to a temp file next to `destination`, then rename over it, so readers
/// never observe a partially written artifact.
pub fn write_atomic(destination: &Path, bytes: &[u8]) -> RenderResult<()> {
    let write_err = |source: std::io::Error| RenderError::Write {
        path: destination.display().to_string(),
        source,
    };
    let dir = destination
        .parent()
        .ok_or_else(|| write_err(std::io::Error::other("artifact path has no parent")))?;
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(destination).map_err(|e| write_err(e.error))?;
    Ok(())
}

fn relative_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
