use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::inspect::{SeriesStack, truncate_uid};
use crate::progress::ProgressLog;

const STAGE: &str = "select";

/// Sequence keywords that mark a true volumetric acquisition.
const VOLUMETRIC_KEYWORDS: [&str; 7] =
    ["3D", "VIBE", "CUBE", "SPACE", "BRAVO", "MPRAGE", "FSPGR"];

/// Score and rationale of one candidate stack.
#[derive(Clone, Debug)]
pub struct CandidateScore {
    pub series_uid: String,
    pub score: i64,
    pub slice_count: usize,
    pub slice_thickness: Option<f64>,
    pub effective_z: f64,
    pub reasons: Vec<String>,
}

/// Scores a stack for 3D suitability: thin, uniform, large wins.
pub fn score_stack(stack: &SeriesStack) -> CandidateScore {
    let first = &stack.slices[0];
    let mut score = 0i64;
    let mut reasons = Vec::new();

    let description = first.series_description.to_ascii_uppercase();
    let image_type = first.image_type.to_ascii_uppercase();
    if VOLUMETRIC_KEYWORDS
        .iter()
        .any(|k| description.contains(k) || image_type.contains(k))
    {
        score += 100;
        reasons.push("volumetric sequence keyword".to_string());
    }

    let thickness = stack.slice_thickness();
    if let Some(t) = thickness {
        if t <= 1.2 {
            score += 50;
            reasons.push(format!("thin slices ({t} mm)"));
        } else if t <= 1.5 {
            score += 30;
            reasons.push(format!("moderate slice thickness ({t} mm)"));
        } else if t <= 2.0 {
            score += 10;
            reasons.push(format!("thicker slices ({t} mm)"));
        } else {
            score -= 20;
            reasons.push(format!("very thick slices ({t} mm)"));
        }
    }

    if let (Some(t), Some(between)) = (
        thickness,
        stack.slices.iter().find_map(|s| s.spacing_between_slices),
    ) {
        if t > 0.0 {
            let ratio = between / t;
            if (0.9..=1.1).contains(&ratio) {
                score += 20;
                reasons.push(format!("uniform spacing (ratio {ratio:.2})"));
            }
        }
    }

    let in_plane = stack.min_in_plane_spacing();
    if in_plane <= 0.5 {
        score += 10;
        reasons.push(format!("fine in-plane spacing ({in_plane} mm)"));
    }

    if stack.len() >= 50 {
        score += 10;
        reasons.push(format!("sufficient slices ({})", stack.len()));
    }

    CandidateScore {
        series_uid: stack.series_uid.clone(),
        score,
        slice_count: stack.len(),
        slice_thickness: thickness,
        effective_z: stack.effective_z_spacing(),
        reasons,
    }
}

/// Outcome of series selection: one primary, ranked alternates, and whether
/// multi-plane fusion stays enabled for this input.
#[derive(Debug)]
pub struct Selection {
    pub primary: SeriesStack,
    pub alternates: Vec<SeriesStack>,
    pub fuse: bool,
}

/// Picks the primary stack.
///
/// Ranking is deterministic regardless of input order: score, then slice
/// count, then smallest effective through-plane spacing, then series UID.
/// `force_series_uid` wins unconditionally when it names a present series.
/// The memory guard downgrades over-large multi-series inputs to
/// single-series processing.
pub fn select(
    stacks: Vec<SeriesStack>,
    config: &PipelineConfig,
    log: &mut ProgressLog,
) -> Result<Selection> {
    if stacks.is_empty() {
        return Err(Error::InvalidInput("no candidate series".into()));
    }

    let mut scored: Vec<(CandidateScore, SeriesStack)> = stacks
        .into_iter()
        .map(|stack| (score_stack(&stack), stack))
        .collect();
    scored.sort_by(|(a, _), (b, _)| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.slice_count.cmp(&a.slice_count))
            .then_with(|| a.effective_z.total_cmp(&b.effective_z))
            .then_with(|| a.series_uid.cmp(&b.series_uid))
    });

    for (rank, (candidate, _)) in scored.iter().take(3).enumerate() {
        log.info(
            STAGE,
            format!(
                "[{}] series {}.. score={} slices={} thickness={:?} z={:.2}mm reasons={:?}",
                rank + 1,
                truncate_uid(&candidate.series_uid),
                candidate.score,
                candidate.slice_count,
                candidate.slice_thickness,
                candidate.effective_z,
                candidate.reasons
            ),
        );
    }

    let mut primary_index = 0usize;
    if let Some(forced) = &config.force_series_uid {
        if let Some(i) = scored.iter().position(|(c, _)| &c.series_uid == forced) {
            primary_index = i;
            log.info(
                STAGE,
                format!("FORCE_SERIES_UID set, using {forced} regardless of scoring"),
            );
        } else {
            log.quality_warning(
                STAGE,
                format!("FORCE_SERIES_UID {forced} not present, ignoring override"),
            );
        }
    }

    let total_slices: usize = scored.iter().map(|(c, _)| c.slice_count).sum();
    let series_count = scored.len();
    let mut fuse = config.use_multi_plane && series_count > 1;
    if fuse
        && (total_slices > config.memory_guard_max_slices
            || series_count >= config.memory_guard_max_series)
    {
        log.info(
            STAGE,
            format!(
                "memory guard: {total_slices} slices across {series_count} series, \
                 disabling multi-plane fusion"
            ),
        );
        fuse = false;
    }

    let (primary_score, primary) = scored.remove(primary_index);
    debug!(
        "Selected series {} with score {}",
        primary_score.series_uid, primary_score.score
    );
    log.info(
        STAGE,
        format!(
            "primary series {}.. ({} slices), {} alternate(s), fusion {}",
            truncate_uid(&primary_score.series_uid),
            primary_score.slice_count,
            scored.len(),
            if fuse { "enabled" } else { "disabled" }
        ),
    );
    Ok(Selection {
        primary,
        alternates: scored.into_iter().map(|(_, stack)| stack).collect(),
        fuse,
    })
}
