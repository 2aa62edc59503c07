use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Bumped whenever the obfuscation transform changes output pixels.
pub const RENDERER_VERSION: &str = "pixelate-v1";

const DIGEST_PREFIX_LEN: usize = 16;
const VERSION_TAG_LEN: usize = 8;

/// Hex SHA-256 of encoded image bytes
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Short tag identifying everything that influences output content besides the
/// source itself: renderer version, render settings and detector versions.
pub fn version_tag(render_settings: &str, detector_versions: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(RENDERER_VERSION.as_bytes());
    hasher.update([0u8]);
    hasher.update(render_settings.as_bytes());
    for (name, version) in detector_versions {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(version.as_bytes());
    }
    let mut tag = hex::encode(hasher.finalize());
    tag.truncate(VERSION_TAG_LEN);
    tag
}

/// Deterministic artifact file name: `<digest prefix>-<version tag>.<ext>`.
pub fn output_name(digest: &str, tag: &str, extension: &str) -> String {
    let prefix = &digest[..digest.len().min(DIGEST_PREFIX_LEN)];
    format!("{}-{}.{}", prefix, tag, extension)
}
