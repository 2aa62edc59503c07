//! Integration tests for the redaction renderer.
//!
//! Tests cover:
//! - Rendering with no regions
//! - Deterministic, idempotent artifact paths
//! - Unreadable and zero-size images
//! - Pixel identity for large images
//! - Cleanup of interrupted writes and withdrawn artifacts

mod common;

use std::collections::BTreeMap;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use platescrub::RenderError;

use common::*;

fn versions() -> BTreeMap<String, String> {
    BTreeMap::from([("text".to_string(), "fake-ocr-1".to_string())])
}

#[test]
fn test_empty_set_still_produces_artifact() -> anyhow::Result<()> {
    // 1. Render the scene with nothing to redact
    let (_inputs, outputs) = workspace();
    let renderer = renderer(outputs.path());
    let source = SourceImage::from_bytes("car.png", scene_png_bytes())?;
    let result = renderer.render(&source, &RedactionSet::new(), &versions())?;

    // 2. A valid image was published, identical to the input
    assert_eq!(result.regions_redacted, 0);
    assert!(result.output_image.starts_with("redacted/"));
    assert!(result.output_image.ends_with(".png"));
    let output = image::open(outputs.path().join(&result.output_image))?.to_rgb8();
    assert_eq!(output, scene_image());

    Ok(())
}

#[test]
fn test_rendering_twice_is_idempotent() -> anyhow::Result<()> {
    let (_inputs, outputs) = workspace();
    let renderer = renderer(outputs.path());
    let source = SourceImage::from_bytes("car.png", scene_png_bytes())?;
    let set = platescrub::merge(
        &[CandidateRegion::text(PLATE, 0.9, "LE75 CFG")],
        &[],
        &Default::default(),
        SCENE_WIDTH,
        SCENE_HEIGHT,
    );

    // 1. First render
    let first = renderer.render(&source, &set, &versions())?;
    let first_bytes = std::fs::read(outputs.path().join(&first.output_image))?;

    // 2. Second render lands at the same path with the same bytes
    let second = renderer.render(&source, &set, &versions())?;
    let second_bytes = std::fs::read(outputs.path().join(&second.output_image))?;
    assert_eq!(first.output_image, second.output_image);
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(artifact_count(outputs.path()), 1);

    Ok(())
}

#[test]
fn test_detector_versions_change_the_artifact_name() -> anyhow::Result<()> {
    let (_inputs, outputs) = workspace();
    let renderer = renderer(outputs.path());
    let source = SourceImage::from_bytes("car.png", scene_png_bytes())?;

    let before = renderer.artifact_path(&source, &versions())?;
    let mut upgraded = versions();
    upgraded.insert("text".to_string(), "fake-ocr-2".to_string());
    let after = renderer.artifact_path(&source, &upgraded)?;

    assert_ne!(before, after);
    Ok(())
}

#[test]
fn test_corrupt_bytes_are_a_render_error() {
    let result = SourceImage::from_bytes("broken.png", b"not an image at all".to_vec());
    assert!(result.is_err());
}

#[test]
fn test_zero_size_image_is_rejected() {
    let result = SourceImage::from_parts(
        "empty.png",
        Vec::new(),
        DynamicImage::new_rgb8(0, 0),
        Some(ImageFormat::Png),
    );
    assert!(matches!(result, Err(RenderError::ZeroSize { .. })));
}

#[test]
fn test_cleanup_removes_only_partial_files() -> anyhow::Result<()> {
    // 1. Publish one real artifact
    let (_inputs, outputs) = workspace();
    let renderer = renderer(outputs.path());
    let source = SourceImage::from_bytes("car.png", scene_png_bytes())?;
    renderer.render(&source, &RedactionSet::new(), &versions())?;

    // 2. Simulate two interrupted writes
    let dir = outputs.path().join("redacted");
    for name in ["a.tmp", "b.tmp"] {
        std::fs::write(
            dir.join(format!("{}{}", platescrub::render::PARTIAL_PREFIX, name)),
            b"half",
        )?;
    }

    // 3. Only the partial files go
    assert_eq!(renderer.cleanup_partial()?, 2);
    assert_eq!(std::fs::read_dir(&dir)?.count(), 1);
    assert_eq!(renderer.cleanup_partial()?, 0);

    Ok(())
}

#[test]
fn test_large_image_keeps_size_and_pixels() -> anyhow::Result<()> {
    // 1. An image well above common downscaling limits
    let large = RgbImage::from_fn(1600, 1000, |x, y| Rgb([(x % 251) as u8, (y % 241) as u8, 77]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(large.clone())
        .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)?;

    // 2. Default settings publish it unchanged
    let (_inputs, outputs) = workspace();
    let renderer = renderer(outputs.path());
    let source = SourceImage::from_bytes("large.png", bytes)?;
    let result = renderer.render(&source, &RedactionSet::new(), &versions())?;

    let output = image::open(outputs.path().join(&result.output_image))?.to_rgb8();
    assert_eq!(output.dimensions(), (1600, 1000));
    assert_eq!(output, large);

    Ok(())
}

#[test]
fn test_withdrawn_artifact_is_no_longer_listed() -> anyhow::Result<()> {
    let (_inputs, outputs) = workspace();
    let renderer = renderer(outputs.path());
    let source = SourceImage::from_bytes("car.png", scene_png_bytes())?;
    let result = renderer.render(&source, &RedactionSet::new(), &versions())?;
    std::fs::write(
        outputs.path().join("redacted").join(format!("{}y.png", platescrub::render::PARTIAL_PREFIX)),
        b"half",
    )?;

    assert_eq!(renderer.artifacts()?, vec![result.output_image.clone()]);
    assert!(renderer.remove_artifact(&result.output_image)?);
    assert!(renderer.artifacts()?.is_empty());
    assert!(!renderer.remove_artifact(&result.output_image)?);

    Ok(())
}
