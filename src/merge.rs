use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::models::{CandidateRegion, CandidateSource, RedactedRegion, RedactionSet};

/// How candidates from different detectors are reconciled
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    /// Candidates overlapping an accepted box at or above this IoU are dropped
    pub iou_threshold: f32,
    /// Added to the confidence of object-detector candidates when ranking
    pub object_bonus: f32,
    /// Fraction of width/height added on each side of an accepted box
    pub margin: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            object_bonus: 0.1,
            margin: 0.15,
        }
    }
}

impl MergeConfig {
    pub fn effective_score(&self, candidate: &CandidateRegion) -> f32 {
        match candidate.source {
            CandidateSource::Object => candidate.confidence + self.object_bonus,
            CandidateSource::Text => candidate.confidence,
        }
    }
}

/// Greedy non-maximum suppression.
///
/// Candidates are visited by descending `score`; one is kept when its IoU with
/// every already kept box is below `iou_threshold`. Equal scores prefer object
/// candidates, then top-left position, so the outcome never depends on input order.
pub fn suppress_overlaps<F>(
    candidates: Vec<CandidateRegion>,
    iou_threshold: f32,
    score: F,
) -> Vec<CandidateRegion>
where
    F: Fn(&CandidateRegion) -> f32,
{
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<(f32, CandidateRegion)> =
        candidates.into_iter().map(|c| (score(&c), c)).collect();
    ranked.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| source_rank(a.source).cmp(&source_rank(b.source)))
            .then_with(|| (a.bbox.y, a.bbox.x).cmp(&(b.bbox.y, b.bbox.x)))
    });

    let total = ranked.len();
    let mut keep: Vec<CandidateRegion> = Vec::new();
    for (score, candidate) in ranked {
        let overlapping = keep
            .iter()
            .any(|kept| kept.bbox.iou(&candidate.bbox) >= iou_threshold);
        if overlapping {
            trace!(
                "Suppressed {} candidate at {:?} (score {:.3})",
                candidate.source.as_str(),
                candidate.bbox,
                score
            );
            continue;
        }
        keep.push(candidate);
    }

    debug!("NMS kept {}/{} candidates", keep.len(), total);
    keep
}

fn source_rank(source: CandidateSource) -> u8 {
    match source {
        CandidateSource::Object => 0,
        CandidateSource::Text => 1,
    }
}

/// Merge text and object candidates for an image of `width` x `height`.
pub fn merge(
    text: &[CandidateRegion],
    object: &[CandidateRegion],
    config: &MergeConfig,
    width: u32,
    height: u32,
) -> RedactionSet {
    merge_all(&[text, object], config, width, height)
}

/// Merge any number of candidate groups into one deduplicated set.
///
/// Overlap is judged on the boxes as detected; the margin is applied only to
/// accepted regions, which are then clamped to the image.
pub fn merge_all(
    groups: &[&[CandidateRegion]],
    config: &MergeConfig,
    width: u32,
    height: u32,
) -> RedactionSet {
    let candidates: Vec<CandidateRegion> = groups
        .iter()
        .flat_map(|group| group.iter().cloned())
        .filter(|c| !c.bbox.is_empty())
        .collect();

    let accepted = suppress_overlaps(candidates, config.iou_threshold, |c| {
        config.effective_score(c)
    });

    let mut set = RedactionSet::new();
    for candidate in accepted {
        let Some(area) = candidate.bbox.expand(config.margin).clamp(width, height) else {
            trace!("Dropping candidate outside the image: {:?}", candidate.bbox);
            continue;
        };
        set.push(RedactedRegion { candidate, area });
    }
    set
}
