// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Job parameters and orchestrator tuning.
//!
//! [`JobParams`] is the user-facing search configuration submitted with a
//! job; [`OrchestratorConfig`] is operator tuning (thresholds, batch size,
//! retry budgets, timeouts, cost table) applied to every job. Both are
//! serde types so the thin transport layer passes them through as JSON.

use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::limiter::LimiterPolicy;
use crate::retry::RetryPolicy;

/// Combine verbosity: a fixed level in 1..=3, or sampled per combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptiveness {
    /// Fixed verbosity level, 1..=3
    Level(u8),
    /// Sample a level independently per combine from the job RNG
    Random,
}

impl Default for Descriptiveness {
    fn default() -> Self {
        Descriptiveness::Random
    }
}

// Wire form is the bare number 1..=3 or the string "random".
impl Serialize for Descriptiveness {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Descriptiveness::Level(level) => serializer.serialize_u8(*level),
            Descriptiveness::Random => serializer.serialize_str("random"),
        }
    }
}

impl<'de> Deserialize<'de> for Descriptiveness {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct DescriptivenessVisitor;

        impl Visitor<'_> for DescriptivenessVisitor {
            type Value = Descriptiveness;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "an integer in 1..=3 or the string \"random\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Self::Value, E> {
                if (1..=3).contains(&value) {
                    Ok(Descriptiveness::Level(value as u8))
                } else {
                    Err(E::custom(format!("descriptiveness {value} out of 1..=3")))
                }
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Self::Value, E> {
                u64::try_from(value)
                    .map_err(|_| E::custom("descriptiveness must be positive"))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
                if value == "random" {
                    Ok(Descriptiveness::Random)
                } else {
                    Err(E::custom(format!(
                        "descriptiveness must be 1..=3 or \"random\", got {value:?}"
                    )))
                }
            }
        }

        deserializer.deserialize_any(DescriptivenessVisitor)
    }
}

/// Options forwarded to the image provider for every leaf
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModalOptions {
    /// Derive and attach a negative prompt when the language capability
    /// supports it
    #[serde(default)]
    pub negative_prompt: bool,
    /// Run the provider's face-restoration pass
    #[serde(default)]
    pub face_fix: bool,
    /// Classifier-free guidance scale override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    /// Sampler steps override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
}

/// User-facing search parameters for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// The prompt to refine
    pub prompt: String,
    /// Children generated per iteration (N)
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
    /// Children kept as next-iteration parents (M)
    #[serde(default = "default_keep_top")]
    pub keep_top: usize,
    /// Refinement iterations to run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Weight between alignment and aesthetics in the total score, [0, 1]
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Sampling temperature for refinements
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Trials per ensemble comparison
    #[serde(default = "default_ensemble_size")]
    pub ensemble_size: usize,
    /// Combine verbosity
    #[serde(default)]
    pub descriptiveness: Descriptiveness,
    /// Seed for the job RNG (descriptiveness sampling, ensemble swap
    /// schedule); random when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Image generation options
    #[serde(default)]
    pub modal: ModalOptions,
}

fn default_beam_width() -> usize {
    4
}
fn default_keep_top() -> usize {
    2
}
fn default_max_iterations() -> u32 {
    3
}
fn default_alpha() -> f64 {
    0.7
}
fn default_temperature() -> f32 {
    0.8
}
fn default_ensemble_size() -> usize {
    3
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            beam_width: default_beam_width(),
            keep_top: default_keep_top(),
            max_iterations: default_max_iterations(),
            alpha: default_alpha(),
            temperature: default_temperature(),
            ensemble_size: default_ensemble_size(),
            descriptiveness: Descriptiveness::default(),
            seed: None,
            modal: ModalOptions::default(),
        }
    }
}

impl JobParams {
    /// Params for `prompt` with defaults everywhere else
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Set the beam width (N)
    #[must_use]
    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.beam_width = beam_width;
        self
    }

    /// Set the keep-top (M)
    #[must_use]
    pub fn with_keep_top(mut self, keep_top: usize) -> Self {
        self.keep_top = keep_top;
        self
    }

    /// Set the iteration budget
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the alignment/aesthetics weight
    #[must_use]
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the refinement temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the ensemble size
    #[must_use]
    pub fn with_ensemble_size(mut self, ensemble_size: usize) -> Self {
        self.ensemble_size = ensemble_size;
        self
    }

    /// Set the combine verbosity
    #[must_use]
    pub fn with_descriptiveness(mut self, descriptiveness: Descriptiveness) -> Self {
        self.descriptiveness = descriptiveness;
        self
    }

    /// Seed the job RNG for deterministic runs
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set image generation options
    #[must_use]
    pub fn with_modal(mut self, modal: ModalOptions) -> Self {
        self.modal = modal;
        self
    }

    /// Check the submission constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] naming the violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(Error::invalid_argument("prompt must not be empty"));
        }
        if self.keep_top == 0 {
            return Err(Error::invalid_argument("keep_top must be >= 1"));
        }
        if self.beam_width < self.keep_top {
            return Err(Error::invalid_argument(format!(
                "beam_width ({}) must be >= keep_top ({})",
                self.beam_width, self.keep_top
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::invalid_argument("max_iterations must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::invalid_argument(format!(
                "alpha ({}) must be in [0, 1]",
                self.alpha
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::invalid_argument(
                "temperature must be a non-negative finite number",
            ));
        }
        if self.ensemble_size == 0 {
            return Err(Error::invalid_argument("ensemble_size must be >= 1"));
        }
        if let Descriptiveness::Level(level) = self.descriptiveness {
            if !(1..=3).contains(&level) {
                return Err(Error::invalid_argument(format!(
                    "descriptiveness level ({level}) must be in 1..=3"
                )));
            }
        }
        Ok(())
    }
}

/// Cold vs warm timeout budgets for one capability.
///
/// The cold budget applies while the provider reports an unloaded or
/// uncached model (first-call model loading); warm applies afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Budget while the model is cold, in milliseconds
    pub cold_ms: u64,
    /// Budget once the model is warm, in milliseconds
    pub warm_ms: u64,
}

impl TimeoutPolicy {
    /// Budget for the given cache state
    #[must_use]
    pub fn pick(&self, cached: bool) -> Duration {
        Duration::from_millis(if cached { self.warm_ms } else { self.cold_ms })
    }
}

/// Per-capability timeout budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTimeouts {
    /// Language capability budgets
    pub language: TimeoutPolicy,
    /// Image capability budgets; cold covers model loading
    pub image: TimeoutPolicy,
    /// Vision capability budgets
    pub vision: TimeoutPolicy,
}

impl Default for CapabilityTimeouts {
    fn default() -> Self {
        Self {
            language: TimeoutPolicy {
                cold_ms: 120_000,
                warm_ms: 30_000,
            },
            image: TimeoutPolicy {
                cold_ms: 300_000,
                warm_ms: 60_000,
            },
            vision: TimeoutPolicy {
                cold_ms: 120_000,
                warm_ms: 30_000,
            },
        }
    }
}

/// Per-capability retry budgets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRetries {
    /// Language call retries
    pub language: RetryPolicy,
    /// Image call retries
    pub image: RetryPolicy,
    /// Vision call retries
    pub vision: RetryPolicy,
}

impl Default for CapabilityRetries {
    fn default() -> Self {
        Self {
            language: RetryPolicy::exponential(3),
            image: RetryPolicy::exponential(3),
            vision: RetryPolicy::exponential(2),
        }
    }
}

/// Cost table used for job cost estimation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostTable {
    /// Dollars per 1K language tokens
    pub language_per_1k_tokens: f64,
    /// Dollars per generated image
    pub image_per_call: f64,
    /// Dollars per vision call
    pub vision_per_call: f64,
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            language_per_1k_tokens: 0.002,
            image_per_call: 0.01,
            vision_per_call: 0.005,
        }
    }
}

/// Operator tuning applied to every job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Largest N handed to one multi-image vision call; clamped at ranking
    /// time to the vision capability's declared limit
    #[serde(default = "default_all_at_once_threshold")]
    pub all_at_once_threshold: usize,
    /// Largest N ranked by the all-pairs tournament
    #[serde(default = "default_all_pairs_max")]
    pub all_pairs_max: usize,
    /// Cap on operations per language batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Events buffered per job for late-subscriber replay
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Default concurrency limits by provider locality
    #[serde(default)]
    pub limiter_policy: LimiterPolicy,
    /// Per-capability retry budgets
    #[serde(default)]
    pub retries: CapabilityRetries,
    /// Per-capability timeout budgets
    #[serde(default)]
    pub timeouts: CapabilityTimeouts,
    /// Prompt rewrites attempted after a content-policy rejection
    #[serde(default = "default_content_policy_retries")]
    pub content_policy_retries: u32,
    /// Score each leaf with the vision capability when it supports scoring
    #[serde(default = "default_enable_scoring")]
    pub enable_scoring: bool,
    /// Cost table for job cost estimation
    #[serde(default)]
    pub cost: CostTable,
}

fn default_all_at_once_threshold() -> usize {
    4
}
fn default_all_pairs_max() -> usize {
    8
}
fn default_max_batch_size() -> usize {
    8
}
fn default_event_buffer() -> usize {
    4096
}
fn default_content_policy_retries() -> u32 {
    2
}
fn default_enable_scoring() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            all_at_once_threshold: default_all_at_once_threshold(),
            all_pairs_max: default_all_pairs_max(),
            max_batch_size: default_max_batch_size(),
            event_buffer: default_event_buffer(),
            limiter_policy: LimiterPolicy::default(),
            retries: CapabilityRetries::default(),
            timeouts: CapabilityTimeouts::default(),
            content_policy_retries: default_content_policy_retries(),
            enable_scoring: default_enable_scoring(),
            cost: CostTable::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] naming the violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.all_at_once_threshold == 0 {
            return Err(Error::invalid_argument("all_at_once_threshold must be >= 1"));
        }
        if self.all_pairs_max < self.all_at_once_threshold {
            return Err(Error::invalid_argument(
                "all_pairs_max must be >= all_at_once_threshold",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::invalid_argument("max_batch_size must be >= 1"));
        }
        if self.event_buffer == 0 {
            return Err(Error::invalid_argument("event_buffer must be >= 1"));
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptiveness_serde_forms() {
        let level: Descriptiveness = serde_json::from_str("2").unwrap();
        assert_eq!(level, Descriptiveness::Level(2));
        let random: Descriptiveness = serde_json::from_str("\"random\"").unwrap();
        assert_eq!(random, Descriptiveness::Random);

        assert_eq!(serde_json::to_string(&Descriptiveness::Level(3)).unwrap(), "3");
        assert_eq!(
            serde_json::to_string(&Descriptiveness::Random).unwrap(),
            "\"random\""
        );

        assert!(serde_json::from_str::<Descriptiveness>("0").is_err());
        assert!(serde_json::from_str::<Descriptiveness>("4").is_err());
        assert!(serde_json::from_str::<Descriptiveness>("\"high\"").is_err());
    }

    #[test]
    fn test_params_defaults_are_valid() {
        let params = JobParams::new("a lighthouse at dusk");
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_params_constraint_violations() {
        assert!(JobParams::new(" ").validate().is_err());
        assert!(JobParams::new("p").with_keep_top(0).validate().is_err());
        assert!(JobParams::new("p")
            .with_beam_width(1)
            .with_keep_top(2)
            .validate()
            .is_err());
        assert!(JobParams::new("p").with_max_iterations(0).validate().is_err());
        assert!(JobParams::new("p").with_alpha(1.5).validate().is_err());
        assert!(JobParams::new("p").with_alpha(-0.1).validate().is_err());
        assert!(JobParams::new("p").with_temperature(f32::NAN).validate().is_err());
        assert!(JobParams::new("p").with_ensemble_size(0).validate().is_err());
        assert!(JobParams::new("p")
            .with_descriptiveness(Descriptiveness::Level(4))
            .validate()
            .is_err());
    }

    #[test]
    fn test_params_json_roundtrip_with_defaults() {
        let parsed: JobParams =
            serde_json::from_str(r#"{"prompt": "a red fox", "beam_width": 6}"#).unwrap();
        assert_eq!(parsed.beam_width, 6);
        assert_eq!(parsed.keep_top, 2);
        assert_eq!(parsed.descriptiveness, Descriptiveness::Random);

        let json = serde_json::to_string(&parsed).unwrap();
        let back: JobParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, parsed);
    }

    #[test]
    fn test_timeout_policy_picks_by_cache_state() {
        let policy = TimeoutPolicy {
            cold_ms: 1000,
            warm_ms: 100,
        };
        assert_eq!(policy.pick(false), Duration::from_millis(1000));
        assert_eq!(policy.pick(true), Duration::from_millis(100));
    }

    #[test]
    fn test_orchestrator_config_validation() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        let bad = OrchestratorConfig {
            all_pairs_max: 2,
            ..OrchestratorConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = OrchestratorConfig {
            max_batch_size: 0,
            ..OrchestratorConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
