// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Capability contracts for the three external dependencies: language
//! (prompt refinement and combination), image (synthesis), and vision
//! (scoring and comparative ranking).
//!
//! Providers implement a required core plus optional extensions surfaced
//! through probe methods (`supports_batch()`, `supports_critique()`,
//! `supports_scoring()`, ...). The orchestrator asks, then chooses a path;
//! it never downcasts or guesses at methods.
//!
//! All methods are async, honor the job's [`CancellationToken`], and report
//! provider health through [`CapabilityStatus`] so the orchestrator can
//! pick cold vs warm timeouts.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::candidate::CandidateKey;
use crate::error::{Error, Result};

/// The external dependencies the orchestrator funnels calls through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// Prompt refinement and combination
    Language,
    /// Image synthesis
    Image,
    /// Scoring and comparative ranking
    Vision,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityKind::Language => write!(f, "language"),
            CapabilityKind::Image => write!(f, "image"),
            CapabilityKind::Vision => write!(f, "vision"),
        }
    }
}

/// Where a provider runs; drives the default concurrency limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    /// In-process or same-host model service (single GPU)
    Local,
    /// Hosted API
    Remote,
}

/// Health probe result, used during startup and to pick cold vs warm
/// timeouts before long-first-call operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityStatus {
    /// Whether the backing model is loaded
    pub model_loaded: bool,
    /// Whether subsequent calls hit a warm cache
    pub cached: bool,
    /// Provider-reported version string
    pub version: Option<String>,
}

impl CapabilityStatus {
    /// A warm, loaded provider
    #[must_use]
    pub fn ready() -> Self {
        Self {
            model_loaded: true,
            cached: true,
            version: None,
        }
    }
}

/// Token counts reported by a language call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the submitted prompt
    pub prompt_tokens: u64,
    /// Tokens generated
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Prompt plus completion tokens
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Accumulate another usage record into this one
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Which facet of the prompt a refinement targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptDimension {
    /// Content: subjects, objects, actions
    What,
    /// Style: lighting, composition, mood
    How,
}

impl std::fmt::Display for PromptDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromptDimension::What => write!(f, "what"),
            PromptDimension::How => write!(f, "how"),
        }
    }
}

/// Options for a single prompt refinement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineOptions {
    /// Facet to refine toward
    pub dimension: PromptDimension,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion budget; provider default when `None`
    pub max_tokens: Option<u32>,
}

/// One refinement in a batch submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineRequest {
    /// Text to refine
    pub text: String,
    /// Refinement options
    pub options: RefineOptions,
}

/// Options for combining a WHAT and HOW prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineOptions {
    /// Verbosity level in 1..=3
    pub descriptiveness: u8,
}

/// Text produced by a language call, with its token accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageResponse {
    /// Generated text
    pub text: String,
    /// Token counts for the call
    pub usage: TokenUsage,
}

/// Addressable reference to a generated image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// URL or opaque blob id; serialized as `url` on the wire
    #[serde(rename = "url")]
    pub locator: String,
    /// Path on local storage, when the provider wrote one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl ImageRef {
    /// Reference by locator only
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            local_path: None,
        }
    }
}

/// Generation parameters forwarded to the image provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageOptions {
    /// Sampler seed; provider chooses when `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Negative prompt, when negative prompting is enabled for the job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Run the provider's face-restoration pass
    #[serde(default)]
    pub face_fix: bool,
    /// Classifier-free guidance scale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    /// Sampler steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
}

/// One image generation request, tagged with the candidate it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    /// Prompt to render
    pub prompt: String,
    /// Generation parameters
    pub options: ImageOptions,
    /// Candidate this image belongs to
    pub tag: CandidateKey,
}

/// A generated image and the parameters that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    /// Where the image lives
    pub image: ImageRef,
    /// Provider-reported generation parameters
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Per-image scores from the vision capability
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageEvaluation {
    /// How well the image matches the prompt, in [0, 100]
    pub alignment: f64,
    /// Visual quality, in [0, 10]
    pub aesthetic: f64,
}

/// Per-factor ranks assigned at comparison time (rank 1 = best)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorRanks {
    /// Rank on prompt alignment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<u32>,
    /// Rank on visual quality
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aesthetics: Option<u32>,
    /// Combined rank
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined: Option<u32>,
}

/// One entry of a comparative ranking, labeled by position in the submitted
/// image list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedImage {
    /// Zero-based index into the submitted image list
    pub index: usize,
    /// Overall rank, 1 = best; equal ranks express a tie
    pub rank: u32,
    /// Provider's reasoning, when given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Per-factor ranks, when given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranks: Option<FactorRanks>,
}

/// Result of a comparative vision call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRanking {
    /// One entry per submitted image
    pub ranking: Vec<RankedImage>,
}

/// Prompt refinement and combination
#[async_trait]
pub trait LanguageCapability: Send + Sync {
    /// Where this provider runs
    fn locality(&self) -> Locality {
        Locality::Remote
    }

    /// Health probe
    async fn status(&self) -> Result<CapabilityStatus>;

    /// Refine `text` toward the requested dimension
    async fn refine_prompt(
        &self,
        text: &str,
        options: &RefineOptions,
        cancel: &CancellationToken,
    ) -> Result<LanguageResponse>;

    /// Merge a WHAT and HOW prompt into a single generation prompt
    async fn combine_prompts(
        &self,
        what: &str,
        how: &str,
        options: &CombineOptions,
        cancel: &CancellationToken,
    ) -> Result<LanguageResponse>;

    /// Whether [`LanguageCapability::refine_batch`] is native rather than
    /// the sequential default
    fn supports_batch_refine(&self) -> bool {
        false
    }

    /// Refine a homogeneous batch. The default runs requests sequentially;
    /// providers with native batching override both this and
    /// [`LanguageCapability::supports_batch_refine`].
    async fn refine_batch(
        &self,
        requests: &[RefineRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<LanguageResponse>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(
                self.refine_prompt(&request.text, &request.options, cancel)
                    .await?,
            );
        }
        Ok(responses)
    }

    /// Whether [`LanguageCapability::generate_critique`] is available
    fn supports_critique(&self) -> bool {
        false
    }

    /// Critique an image against the prompt that produced it, seeding the
    /// next refinement round
    async fn generate_critique(
        &self,
        _image: &ImageRef,
        _prompt: &str,
        _cancel: &CancellationToken,
    ) -> Result<LanguageResponse> {
        Err(Error::capability(
            CapabilityKind::Language.to_string(),
            "critique generation not supported",
        ))
    }

    /// Whether [`LanguageCapability::generate_negative_prompt`] is available
    fn supports_negative_prompt(&self) -> bool {
        false
    }

    /// Derive a negative prompt from a positive one
    async fn generate_negative_prompt(
        &self,
        _positive: &str,
        _cancel: &CancellationToken,
    ) -> Result<LanguageResponse> {
        Err(Error::capability(
            CapabilityKind::Language.to_string(),
            "negative prompt generation not supported",
        ))
    }
}

/// Image synthesis
#[async_trait]
pub trait ImageCapability: Send + Sync {
    /// Where this provider runs
    fn locality(&self) -> Locality {
        Locality::Local
    }

    /// Health probe
    async fn status(&self) -> Result<CapabilityStatus>;

    /// Render one image
    async fn generate_image(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<GeneratedImage>;

    /// Whether [`ImageCapability::generate_images`] is native rather than
    /// the sequential default
    fn supports_batch(&self) -> bool {
        false
    }

    /// Render a batch of images, one result per request, in request order
    async fn generate_images(
        &self,
        requests: &[ImageRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedImage>> {
        let mut images = Vec::with_capacity(requests.len());
        for request in requests {
            images.push(self.generate_image(request, cancel).await?);
        }
        Ok(images)
    }
}

/// Scoring and comparative ranking
#[async_trait]
pub trait VisionCapability: Send + Sync {
    /// Where this provider runs
    fn locality(&self) -> Locality {
        Locality::Remote
    }

    /// Health probe
    async fn status(&self) -> Result<CapabilityStatus>;

    /// Whether [`VisionCapability::analyze_image`] is available
    fn supports_scoring(&self) -> bool {
        false
    }

    /// Score one image against the prompt
    async fn analyze_image(
        &self,
        _image: &ImageRef,
        _prompt: &str,
        _cancel: &CancellationToken,
    ) -> Result<ImageEvaluation> {
        Err(Error::capability(
            CapabilityKind::Vision.to_string(),
            "per-image scoring not supported",
        ))
    }

    /// Largest image list [`VisionCapability::compare_images`] accepts
    fn max_images_per_compare(&self) -> usize {
        2
    }

    /// Comparatively rank the submitted images against the prompt
    async fn compare_images(
        &self,
        images: &[ImageRef],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<ComparisonRanking>;
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_kind_display() {
        assert_eq!(CapabilityKind::Language.to_string(), "language");
        assert_eq!(CapabilityKind::Image.to_string(), "image");
        assert_eq!(CapabilityKind::Vision.to_string(), "vision");
    }

    #[test]
    fn test_token_usage_accumulation() {
        let mut usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        };
        usage.add(TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 7,
        });
        assert_eq!(usage.prompt_tokens, 13);
        assert_eq!(usage.completion_tokens, 12);
        assert_eq!(usage.total(), 25);
    }

    #[test]
    fn test_image_ref_serialization_omits_empty_path() {
        let json = serde_json::to_value(ImageRef::new("blob://abc")).unwrap();
        assert_eq!(json["url"], "blob://abc");
        assert!(json.get("local_path").is_none());
    }

    #[test]
    fn test_dimension_serde_roundtrip() {
        let json = serde_json::to_string(&PromptDimension::What).unwrap();
        assert_eq!(json, "\"what\"");
        let parsed: PromptDimension = serde_json::from_str("\"how\"").unwrap();
        assert_eq!(parsed, PromptDimension::How);
    }
}
