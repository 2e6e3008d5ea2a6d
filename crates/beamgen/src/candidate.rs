// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The candidate data model: one leaf of the beam-search tree.

use serde::{Deserialize, Serialize};

use crate::capability::{ImageEvaluation, ImageRef, TokenUsage};

/// Identifier of a candidate within its iteration.
///
/// Candidate ids form the contiguous range `[0, beam_width)` inside one
/// iteration; the pair `(iteration, candidate_id)` is canonical.
pub type CandidateId = u32;

/// Canonical candidate identity across iterations.
///
/// Displays as the external form `i{iteration}c{candidate_id}` used for
/// storage paths and UI labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateKey {
    /// Iteration the candidate belongs to
    pub iteration: u32,
    /// Id within the iteration
    pub candidate_id: CandidateId,
}

impl CandidateKey {
    /// Key for `(iteration, candidate_id)`
    #[must_use]
    pub fn new(iteration: u32, candidate_id: CandidateId) -> Self {
        Self {
            iteration,
            candidate_id,
        }
    }
}

impl std::fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i{}c{}", self.iteration, self.candidate_id)
    }
}

/// Generation parameters and accounting attached to a candidate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateMetadata {
    /// Provider-reported image generation parameters
    #[serde(default)]
    pub generation: serde_json::Value,
    /// Language tokens spent producing this candidate's prompts
    #[serde(default)]
    pub token_usage: TokenUsage,
}

/// One leaf of the search tree.
///
/// Candidates are created during a single iteration and never mutated after
/// their evaluation and rank are set; they are then either consumed as
/// parents of the next iteration or returned as the final beam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Iteration this candidate was created in
    pub iteration: u32,
    /// Id within the iteration, contiguous from 0
    pub candidate_id: CandidateId,
    /// Parent in the previous iteration; `None` only at iteration 0
    pub parent_id: Option<CandidateId>,
    /// Content facet of the prompt
    pub what_prompt: String,
    /// Style facet of the prompt
    pub how_prompt: String,
    /// Merged generation prompt
    pub combined_prompt: String,
    /// The generated image
    pub image: ImageRef,
    /// Per-image scores, when scoring ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<ImageEvaluation>,
    /// `alpha * alignment + (1 - alpha) * aesthetic * 10`, when scored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_score: Option<f64>,
    /// Rank within the iteration, 1 = best, once ranking ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    /// Ranker's reasoning for this position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether generation persistently failed; failed candidates rank last
    #[serde(default)]
    pub failed: bool,
    /// Generation parameters and token accounting
    #[serde(default)]
    pub metadata: CandidateMetadata,
}

impl Candidate {
    /// Canonical identity
    #[must_use]
    pub fn key(&self) -> CandidateKey {
        CandidateKey::new(self.iteration, self.candidate_id)
    }

    /// Weighted total score for an evaluation.
    ///
    /// Alignment is on [0, 100] and aesthetic on [0, 10]; the aesthetic is
    /// scaled by 10 so both factors share a scale before weighting.
    #[must_use]
    pub fn weighted_score(evaluation: &ImageEvaluation, alpha: f64) -> f64 {
        alpha * evaluation.alignment + (1.0 - alpha) * evaluation.aesthetic * 10.0
    }

    /// Attach an evaluation and recompute `total_score`
    pub fn set_evaluation(&mut self, evaluation: ImageEvaluation, alpha: f64) {
        self.total_score = Some(Self::weighted_score(&evaluation, alpha));
        self.evaluation = Some(evaluation);
    }
}
