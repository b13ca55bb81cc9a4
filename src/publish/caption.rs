//! Caption rendering for roast publications.
//!
//! Captions are rendered with `tera` from a small set of templates per
//! [`DefectKind`]. The template variant is picked from the fingerprint, so the
//! same artifact always gets the same text and a re-run never produces a
//! second, differently-worded post.

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

use crate::error::CaptionError;
use crate::scoring::{AnalysisResult, DefectKind};
use crate::utils::truncate_chars;

/// Maximum caption length, in characters.
pub const DEFAULT_MAX_CHARS: usize = 280;

const WARP_TEMPLATES: &[&str] = &[
    "{{ mentions }}Warp score {{ warp_score }} with {{ warp_rate }} of frames bending out of shape. Physics check failed.{{ hashtag }}",
    "Motion field gave up: warp {{ warp_score }}, {{ warp_rate }} of steps over the limit.{{ mentions_tail }}{{ hashtag }}",
    "{{ mentions }}This clip warps at a {{ warp_rate }} rate (score {{ warp_score }}). Time for a physics patch?{{ hashtag }}",
];

const MELT_TEMPLATES: &[&str] = &[
    "{{ mentions }}Objects melting in {{ melt_rate }} of frames. Shapes do not survive this one.{{ hashtag }}",
    "Melt rate {{ melt_rate }}: detections dissolve mid-clip.{{ mentions_tail }}{{ hashtag }}",
    "{{ mentions }}Coherence fail, {{ melt_rate }} of frames lose their objects. Quality score {{ overall_score }}/100.{{ hashtag }}",
];

const COMPOUND_TEMPLATES: &[&str] = &[
    "{{ mentions }}Double defect: warp {{ warp_score }} plus {{ melt_rate }} melted frames. Score {{ overall_score }}/100.{{ hashtag }}",
    "{{ defect_count }} defects in one clip: warping at {{ warp_rate }}, melting at {{ melt_rate }}.{{ mentions_tail }}{{ hashtag }}",
    "{{ mentions }}Warp {{ warp_score }}, melt {{ melt_rate }}, overall {{ overall_score }}/100. Everything that can break, broke.{{ hashtag }}",
];

const LOW_SCORE_TEMPLATES: &[&str] = &[
    "{{ mentions }}Quality score {{ overall_score }}/100. Coherence {{ coherence_score }}, trajectory {{ trajectory_score }}.{{ hashtag }}",
    "Overall {{ overall_score }}/100: frames do not hold together.{{ mentions_tail }}{{ hashtag }}",
];

/// Caption settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    /// Handles mentioned in the caption, e.g. `@vendor`.
    pub mentions: Vec<String>,
    pub hashtag: Option<String>,
    pub max_chars: usize,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            mentions: Vec::new(),
            hashtag: None,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

impl CaptionConfig {
    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn with_hashtag(mut self, hashtag: impl Into<String>) -> Self {
        self.hashtag = Some(hashtag.into());
        self
    }
}

fn templates_for(kind: DefectKind) -> &'static [&'static str] {
    match kind {
        DefectKind::Warp => WARP_TEMPLATES,
        DefectKind::Melt => MELT_TEMPLATES,
        DefectKind::Compound => COMPOUND_TEMPLATES,
        DefectKind::LowScore => LOW_SCORE_TEMPLATES,
    }
}

/// Variant index derived from the leading hex digits of `fingerprint`.
fn variant(fingerprint: &str, count: usize) -> usize {
    let prefix: String = fingerprint.chars().take(8).collect();
    let seed = u64::from_str_radix(&prefix, 16).unwrap_or(0);
    (seed % count.max(1) as u64) as usize
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

/// Renders the roast caption for a roast-flagged analysis.
pub fn render_caption(
    analysis: &AnalysisResult,
    fingerprint: &str,
    config: &CaptionConfig,
) -> Result<String, CaptionError> {
    let kind = analysis
        .defect_kind()
        .ok_or_else(|| CaptionError::NoDefect(analysis.artifact_id().to_string()))?;
    let templates = templates_for(kind);
    let template = templates[variant(fingerprint, templates.len())];

    let mentions = config.mentions.join(" ");
    let mut context = Context::new();
    context.insert(
        "mentions",
        &if mentions.is_empty() {
            String::new()
        } else {
            format!("{} ", mentions)
        },
    );
    context.insert(
        "mentions_tail",
        &if mentions.is_empty() {
            String::new()
        } else {
            format!(" {}", mentions)
        },
    );
    context.insert(
        "hashtag",
        &config
            .hashtag
            .as_ref()
            .map(|tag| format!(" {}", tag))
            .unwrap_or_default(),
    );
    context.insert("warp_score", &format!("{:.1}", analysis.warp_score()));
    context.insert("warp_rate", &percent(analysis.warp_rate()));
    context.insert("melt_rate", &percent(analysis.melt_rate()));
    context.insert("coherence_score", &format!("{:.1}", analysis.coherence_score()));
    context.insert("trajectory_score", &format!("{:.1}", analysis.trajectory_score()));
    context.insert("overall_score", &format!("{:.1}", analysis.overall_score()));
    context.insert("defect_count", &analysis.defect_count());

    let rendered = Tera::one_off(template, &context, false)?;
    Ok(truncate_chars(rendered.trim(), config.max_chars))
}
