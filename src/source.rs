use std::io::Cursor;
use std::path::PathBuf;

use image::{DynamicImage, ImageDecoder, ImageError, ImageFormat, ImageReader};
use tracing::debug;

use crate::errors::{RedactError, RenderError, RenderResult};
use crate::render::naming::content_digest;

/// An image handed to the pipeline, by path or by value.
#[derive(Debug, Clone)]
pub enum ImageInput {
    Path(PathBuf),
    Bytes { label: String, data: Vec<u8> },
}

impl ImageInput {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        ImageInput::Path(path.into())
    }

    pub fn bytes(label: impl Into<String>, data: Vec<u8>) -> Self {
        ImageInput::Bytes {
            label: label.into(),
            data,
        }
    }

    /// Human-readable name of the input (file path or caller label)
    pub fn label(&self) -> String {
        match self {
            ImageInput::Path(path) => path.display().to_string(),
            ImageInput::Bytes { label, .. } => label.clone(),
        }
    }

    /// Key used to serialise jobs touching the same image.
    ///
    /// Artifact names derive from the content digest, so the key does too: a
    /// path and a byte buffer holding the same image share one key. Unreadable
    /// paths fall back to the canonical path; such jobs fail before rendering.
    pub fn identity(&self) -> String {
        match self {
            ImageInput::Path(path) => match std::fs::read(path) {
                Ok(data) => format!("sha256:{}", content_digest(&data)),
                Err(_) => {
                    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
                    format!("path:{}", canonical.display())
                }
            },
            ImageInput::Bytes { data, .. } => format!("sha256:{}", content_digest(data)),
        }
    }

    /// Cheap checks done at submission time, before any job exists.
    pub fn validate(&self) -> Result<(), RedactError> {
        match self {
            ImageInput::Path(path) => {
                let meta = std::fs::metadata(path).map_err(|e| {
                    RedactError::InvalidInput(format!("{}: {}", path.display(), e))
                })?;
                if !meta.is_file() {
                    return Err(RedactError::InvalidInput(format!(
                        "{} is not a file",
                        path.display()
                    )));
                }
                if meta.len() == 0 {
                    return Err(RedactError::InvalidInput(format!(
                        "{} is empty",
                        path.display()
                    )));
                }
                Ok(())
            }
            ImageInput::Bytes { label, data } => {
                if data.is_empty() {
                    return Err(RedactError::InvalidInput(format!("{} is empty", label)));
                }
                Ok(())
            }
        }
    }

    pub fn read(&self) -> RenderResult<Vec<u8>> {
        match self {
            ImageInput::Path(path) => std::fs::read(path).map_err(|source| RenderError::Read {
                path: path.display().to_string(),
                source,
            }),
            ImageInput::Bytes { data, .. } => Ok(data.clone()),
        }
    }
}

/// A decoded, immutable source image together with its original encoded bytes.
#[derive(Debug, Clone)]
pub struct SourceImage {
    label: String,
    bytes: Vec<u8>,
    image: DynamicImage,
    format: Option<ImageFormat>,
    digest: String,
}

impl SourceImage {
    pub fn load(input: &ImageInput) -> RenderResult<Self> {
        let bytes = input.read()?;
        Self::from_bytes(input.label(), bytes)
    }

    /// Decode encoded bytes, applying EXIF orientation so pixel coordinates match
    /// what viewers display.
    pub fn from_bytes(label: impl Into<String>, bytes: Vec<u8>) -> RenderResult<Self> {
        let label = label.into();
        let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|source| RenderError::Read {
                path: label.clone(),
                source,
            })?;
        let format = reader.format();
        if format.is_none() {
            return Err(RenderError::UnsupportedFormat(format!(
                "could not determine format of {}",
                label
            )));
        }

        let mut decoder = reader.into_decoder().map_err(decode_error)?;
        let orientation = decoder
            .orientation()
            .unwrap_or(image::metadata::Orientation::NoTransforms);
        let mut image = DynamicImage::from_decoder(decoder).map_err(decode_error)?;
        image.apply_orientation(orientation);

        debug!(
            "Decoded {} ({}x{}, {:?}, {:?})",
            label,
            image.width(),
            image.height(),
            format,
            orientation
        );
        Self::from_parts(label, bytes, image, format)
    }

    /// Assemble a source from already-decoded pixels.
    pub fn from_parts(
        label: impl Into<String>,
        bytes: Vec<u8>,
        image: DynamicImage,
        format: Option<ImageFormat>,
    ) -> RenderResult<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(RenderError::ZeroSize {
                width: image.width(),
                height: image.height(),
            });
        }
        let digest = content_digest(&bytes);
        Ok(Self {
            label: label.into(),
            bytes,
            image,
            format,
            digest,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    /// Hex SHA-256 of the encoded source bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

fn decode_error(err: ImageError) -> RenderError {
    match err {
        ImageError::Unsupported(e) => RenderError::UnsupportedFormat(e.to_string()),
        other => RenderError::Decode(other),
    }
}
