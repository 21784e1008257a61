//! Ranking of raw nearest-neighbor candidates.
//!
//! Two policies turn a best-first candidate list into the final id list:
//!
//! - Image queries keep candidates above an absolute similarity threshold.
//!   A true image match is expected to score high on its own.
//! - Text queries over-fetch, rescale the similarities, run a softmax over
//!   the fetched set and keep candidates carrying at least a fixed share of
//!   the probability mass. Text/image similarities sit in a narrow band, so
//!   the cutoff is relative to the other candidates instead of absolute.
//!
//! Both policies keep the incoming order and never pad the result.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::search::index::Candidate;

/// Default image policy threshold (cosine similarity lower bound)
pub const DEFAULT_IMAGE_THRESHOLD: f32 = 0.5;
/// Default candidate over-fetch factor for text queries
pub const DEFAULT_TEXT_OVERFETCH: usize = 2;
/// Default absolute threshold used while over-fetching for text queries
pub const DEFAULT_TEXT_FLOOR: f32 = 0.0;
/// Default rescale factor applied before the softmax
pub const DEFAULT_SOFTMAX_SCALE: f32 = 100.0;
/// Default minimum softmax weight for a text candidate to survive
pub const DEFAULT_SOFTMAX_CUTOFF: f32 = 0.01;

/// Tuning knobs for both ranking policies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankerConfig {
    /// Similarity lower bound for image queries [-1.0, 1.0]
    #[serde(default = "default_image_threshold")]
    pub image_threshold: f32,

    /// Text queries fetch `text_overfetch * top_k` candidates
    #[serde(default = "default_text_overfetch")]
    pub text_overfetch: usize,

    /// Similarity lower bound used for the text over-fetch [-1.0, 1.0]
    #[serde(default = "default_text_floor")]
    pub text_floor: f32,

    /// Factor similarities are multiplied by before the softmax
    #[serde(default = "default_softmax_scale")]
    pub softmax_scale: f32,

    /// Minimum softmax weight (0.0, 1.0]
    #[serde(default = "default_softmax_cutoff")]
    pub softmax_cutoff: f32,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            image_threshold: DEFAULT_IMAGE_THRESHOLD,
            text_overfetch: DEFAULT_TEXT_OVERFETCH,
            text_floor: DEFAULT_TEXT_FLOOR,
            softmax_scale: DEFAULT_SOFTMAX_SCALE,
            softmax_cutoff: DEFAULT_SOFTMAX_CUTOFF,
        }
    }
}

fn default_image_threshold() -> f32 {
    DEFAULT_IMAGE_THRESHOLD
}

fn default_text_overfetch() -> usize {
    DEFAULT_TEXT_OVERFETCH
}

fn default_text_floor() -> f32 {
    DEFAULT_TEXT_FLOOR
}

fn default_softmax_scale() -> f32 {
    DEFAULT_SOFTMAX_SCALE
}

fn default_softmax_cutoff() -> f32 {
    DEFAULT_SOFTMAX_CUTOFF
}

impl RankerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (-1.0..=1.0).contains(&self.image_threshold),
            "image_threshold must be between -1.0 and 1.0, got {}",
            self.image_threshold
        );
        ensure!(
            self.text_overfetch >= 1,
            "text_overfetch must be at least 1, got {}",
            self.text_overfetch
        );
        ensure!(
            (-1.0..=1.0).contains(&self.text_floor),
            "text_floor must be between -1.0 and 1.0, got {}",
            self.text_floor
        );
        ensure!(
            self.softmax_scale.is_finite() && self.softmax_scale > 0.0,
            "softmax_scale must be a positive number, got {}",
            self.softmax_scale
        );
        ensure!(
            self.softmax_cutoff > 0.0 && self.softmax_cutoff <= 1.0,
            "softmax_cutoff must be in (0.0, 1.0], got {}",
            self.softmax_cutoff
        );
        Ok(())
    }
}

/// Numerically stable softmax.
///
/// The maximum is subtracted before exponentiating. Returns an empty vector
/// for empty input.
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let Some(max) = values.iter().copied().map(f64::from).reduce(f64::max) else {
        return vec![];
    };

    let exps: Vec<f64> = values
        .iter()
        .map(|&v| (f64::from(v) - max).exp())
        .collect();
    let sum: f64 = exps.iter().sum();

    exps.into_iter().map(|e| (e / sum) as f32).collect()
}

/// Applies the image and text ranking policies.
#[derive(Clone, Debug, Default)]
pub struct SearchRanker {
    config: RankerConfig,
}

impl SearchRanker {
    pub fn new(config: RankerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    /// How many candidates to request from the index for a text query.
    pub fn text_fetch_size(&self, top_k: usize) -> usize {
        top_k.saturating_mul(self.config.text_overfetch)
    }

    /// Keep candidates with `similarity >= threshold`, at most `top_k`.
    pub fn rank_by_image(&self, candidates: &[Candidate], top_k: usize, threshold: f32) -> Vec<u64> {
        debug_assert_best_first(candidates);

        candidates
            .iter()
            .filter(|c| c.similarity >= threshold)
            .take(top_k)
            .map(|c| c.id)
            .collect()
    }

    /// Keep candidates whose softmax weight over the rescaled similarities
    /// reaches the configured cutoff, at most `top_k`.
    ///
    /// `candidates` is expected to be the over-fetched set (see
    /// [`Self::text_fetch_size`]); the softmax is taken over all of it.
    pub fn rank_by_text(&self, candidates: &[Candidate], top_k: usize) -> Vec<u64> {
        debug_assert_best_first(candidates);

        if top_k == 0 {
            return vec![];
        }

        let scaled: Vec<f32> = candidates
            .iter()
            .map(|c| c.similarity * self.config.softmax_scale)
            .collect();
        let weights = softmax(&scaled);

        let ranked: Vec<u64> = candidates
            .iter()
            .zip(weights)
            .filter(|(_, weight)| *weight >= self.config.softmax_cutoff)
            .take(top_k)
            .map(|(c, _)| c.id)
            .collect();

        log::debug!(
            "Text ranking kept {} of {} candidates",
            ranked.len(),
            candidates.len()
        );
        ranked
    }
}

fn debug_assert_best_first(candidates: &[Candidate]) {
    debug_assert!(
        candidates
            .windows(2)
            .all(|w| w[0].similarity >= w[1].similarity),
        "candidates must be ordered by descending similarity"
    );
}
