//! Mock capabilities for tests and local development.
//!
//! Each mock mirrors the real capability trait with scripted behavior:
//! fixed or handler-driven responses, per-method call counters, recorded
//! call history, and fault injection (`fail_next`, content-policy
//! triggers). Defaults are deterministic so orchestration tests can assert
//! exact prompts and orderings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cancel::CancellationToken;
use crate::capability::{
    CapabilityStatus, ComparisonRanking, GeneratedImage, ImageCapability, ImageEvaluation,
    ImageRef, ImageRequest, LanguageCapability, LanguageResponse, Locality, PromptDimension,
    RankedImage, RefineOptions, TokenUsage, VisionCapability,
};
use crate::error::{Error, Result};

fn mock_usage(input: &str) -> TokenUsage {
    TokenUsage {
        prompt_tokens: (input.len() as u64).div_ceil(4),
        completion_tokens: 12,
    }
}

/// Handler type for scripted refinements
pub type RefineHandler =
    Arc<dyn Fn(&str, PromptDimension) -> Result<String> + Send + Sync>;
/// Handler type for scripted combines
pub type CombineHandler = Arc<dyn Fn(&str, &str, u8) -> Result<String> + Send + Sync>;
/// Handler type for scripted image scores
pub type AnalyzeHandler = Arc<dyn Fn(&ImageRef, &str) -> Result<ImageEvaluation> + Send + Sync>;
/// Handler type for scripted comparisons
pub type CompareHandler =
    Arc<dyn Fn(&[ImageRef], &str) -> Result<ComparisonRanking> + Send + Sync>;

/// A configurable mock language capability
///
/// # Example
///
/// ```rust
/// use beamgen::testing::MockLanguage;
///
/// let language = MockLanguage::new()
///     .with_refine_handler(|text, dim| Ok(format!("{text} [{dim}]")));
/// ```
#[derive(Clone)]
pub struct MockLanguage {
    refine_handler: Option<RefineHandler>,
    combine_handler: Option<CombineHandler>,
    batch_refine: bool,
    critique: bool,
    negative_prompt: bool,
    locality: Locality,
    latency: Option<Duration>,
    /// Substring that triggers a content-policy rejection
    policy_trigger: Option<String>,
    fail_next: Arc<Mutex<u32>>,
    refine_calls: Arc<AtomicU64>,
    combine_calls: Arc<AtomicU64>,
    critique_calls: Arc<AtomicU64>,
    negative_calls: Arc<AtomicU64>,
    batch_calls: Arc<AtomicU64>,
    history: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MockLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLanguage")
            .field("refine_calls", &self.refine_calls())
            .field("combine_calls", &self.combine_calls())
            .finish()
    }
}

impl Default for MockLanguage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLanguage {
    /// Deterministic mock: refinements are suffixed with their dimension,
    /// combines join the facets
    #[must_use]
    pub fn new() -> Self {
        Self {
            refine_handler: None,
            combine_handler: None,
            batch_refine: false,
            critique: false,
            negative_prompt: false,
            locality: Locality::Remote,
            latency: None,
            policy_trigger: None,
            fail_next: Arc::new(Mutex::new(0)),
            refine_calls: Arc::new(AtomicU64::new(0)),
            combine_calls: Arc::new(AtomicU64::new(0)),
            critique_calls: Arc::new(AtomicU64::new(0)),
            negative_calls: Arc::new(AtomicU64::new(0)),
            batch_calls: Arc::new(AtomicU64::new(0)),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script refinements
    #[must_use]
    pub fn with_refine_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, PromptDimension) -> Result<String> + Send + Sync + 'static,
    {
        self.refine_handler = Some(Arc::new(handler));
        self
    }

    /// Script combines
    #[must_use]
    pub fn with_combine_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str, u8) -> Result<String> + Send + Sync + 'static,
    {
        self.combine_handler = Some(Arc::new(handler));
        self
    }

    /// Advertise native batch refinement
    #[must_use]
    pub fn with_batch_refine(mut self) -> Self {
        self.batch_refine = true;
        self
    }

    /// Advertise critique support
    #[must_use]
    pub fn with_critique(mut self) -> Self {
        self.critique = true;
        self
    }

    /// Advertise negative-prompt support
    #[must_use]
    pub fn with_negative_prompt(mut self) -> Self {
        self.negative_prompt = true;
        self
    }

    /// Report the given locality
    #[must_use]
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// Sleep before every response
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject any input containing `trigger` with a content-policy error
    #[must_use]
    pub fn with_policy_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.policy_trigger = Some(trigger.into());
        self
    }

    /// Fail the next `count` calls with a capability error
    pub fn fail_next(&self, count: u32) {
        *self.fail_next.lock() = count;
    }

    /// Refinement calls made (batch entries excluded)
    #[must_use]
    pub fn refine_calls(&self) -> u64 {
        self.refine_calls.load(Ordering::SeqCst)
    }

    /// Combine calls made
    #[must_use]
    pub fn combine_calls(&self) -> u64 {
        self.combine_calls.load(Ordering::SeqCst)
    }

    /// Critique calls made
    #[must_use]
    pub fn critique_calls(&self) -> u64 {
        self.critique_calls.load(Ordering::SeqCst)
    }

    /// Negative-prompt calls made
    #[must_use]
    pub fn negative_calls(&self) -> u64 {
        self.negative_calls.load(Ordering::SeqCst)
    }

    /// Native batch calls made
    #[must_use]
    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Inputs seen, in call order
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    async fn pre_call(&self, input: &str, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        cancel.check()?;
        {
            let mut failures = self.fail_next.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::capability("language", "injected failure"));
            }
        }
        if let Some(trigger) = &self.policy_trigger {
            if input.contains(trigger.as_str()) {
                return Err(Error::content_policy("language", "prompt flagged"));
            }
        }
        self.history.lock().push(input.to_string());
        Ok(())
    }
}

#[async_trait]
impl LanguageCapability for MockLanguage {
    fn locality(&self) -> Locality {
        self.locality
    }

    async fn status(&self) -> Result<CapabilityStatus> {
        Ok(CapabilityStatus::ready())
    }

    async fn refine_prompt(
        &self,
        text: &str,
        options: &RefineOptions,
        cancel: &CancellationToken,
    ) -> Result<LanguageResponse> {
        self.pre_call(text, cancel).await?;
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        let refined = match &self.refine_handler {
            Some(handler) => handler(text, options.dimension)?,
            None => format!("{text} [{}]", options.dimension),
        };
        Ok(LanguageResponse {
            usage: mock_usage(text),
            text: refined,
        })
    }

    async fn combine_prompts(
        &self,
        what: &str,
        how: &str,
        options: &crate::capability::CombineOptions,
        cancel: &CancellationToken,
    ) -> Result<LanguageResponse> {
        let input = format!("{what} | {how}");
        self.pre_call(&input, cancel).await?;
        self.combine_calls.fetch_add(1, Ordering::SeqCst);
        let combined = match &self.combine_handler {
            Some(handler) => handler(what, how, options.descriptiveness)?,
            None => format!("{what}, {how} (d{})", options.descriptiveness),
        };
        Ok(LanguageResponse {
            usage: mock_usage(&input),
            text: combined,
        })
    }

    fn supports_batch_refine(&self) -> bool {
        self.batch_refine
    }

    async fn refine_batch(
        &self,
        requests: &[crate::capability::RefineRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<LanguageResponse>> {
        if !self.batch_refine {
            // Fall back to the trait's sequential default path.
            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                responses.push(
                    self.refine_prompt(&request.text, &request.options, cancel)
                        .await?,
                );
            }
            return Ok(responses);
        }
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            self.pre_call(&request.text, cancel).await?;
            let refined = match &self.refine_handler {
                Some(handler) => handler(&request.text, request.options.dimension)?,
                None => format!("{} [{}]", request.text, request.options.dimension),
            };
            responses.push(LanguageResponse {
                usage: mock_usage(&request.text),
                text: refined,
            });
        }
        Ok(responses)
    }

    fn supports_critique(&self) -> bool {
        self.critique
    }

    async fn generate_critique(
        &self,
        image: &ImageRef,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<LanguageResponse> {
        if !self.critique {
            return Err(Error::capability("language", "critique not supported"));
        }
        self.pre_call(prompt, cancel).await?;
        self.critique_calls.fetch_add(1, Ordering::SeqCst);
        Ok(LanguageResponse {
            usage: mock_usage(prompt),
            text: format!("critique of {}: {prompt}", image.locator),
        })
    }

    fn supports_negative_prompt(&self) -> bool {
        self.negative_prompt
    }

    async fn generate_negative_prompt(
        &self,
        positive: &str,
        cancel: &CancellationToken,
    ) -> Result<LanguageResponse> {
        if !self.negative_prompt {
            return Err(Error::capability(
                "language",
                "negative prompt not supported",
            ));
        }
        self.pre_call(positive, cancel).await?;
        self.negative_calls.fetch_add(1, Ordering::SeqCst);
        Ok(LanguageResponse {
            usage: mock_usage(positive),
            text: "blurry, distorted, low quality".to_string(),
        })
    }
}

/// A configurable mock image capability.
///
/// Locators are deterministic (`mock://{iteration}/{candidate_id}`), so
/// tests can script vision behavior against them.
#[derive(Clone)]
pub struct MockImage {
    batch: bool,
    locality: Locality,
    latency: Option<Duration>,
    policy_trigger: Option<String>,
    fail_next: Arc<Mutex<u32>>,
    generate_calls: Arc<AtomicU64>,
    batch_calls: Arc<AtomicU64>,
    history: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MockImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockImage")
            .field("generate_calls", &self.generate_calls())
            .field("batch_calls", &self.batch_calls())
            .finish()
    }
}

impl Default for MockImage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockImage {
    /// Deterministic mock renderer
    #[must_use]
    pub fn new() -> Self {
        Self {
            batch: false,
            locality: Locality::Local,
            latency: None,
            policy_trigger: None,
            fail_next: Arc::new(Mutex::new(0)),
            generate_calls: Arc::new(AtomicU64::new(0)),
            batch_calls: Arc::new(AtomicU64::new(0)),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Advertise native batching
    #[must_use]
    pub fn with_batch(mut self) -> Self {
        self.batch = true;
        self
    }

    /// Report the given locality
    #[must_use]
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// Sleep before every response
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject any prompt containing `trigger` with a content-policy error
    #[must_use]
    pub fn with_policy_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.policy_trigger = Some(trigger.into());
        self
    }

    /// Fail the next `count` calls with a capability error
    pub fn fail_next(&self, count: u32) {
        *self.fail_next.lock() = count;
    }

    /// Single-image calls made
    #[must_use]
    pub fn generate_calls(&self) -> u64 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Batch calls made
    #[must_use]
    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Prompts seen, in call order
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    async fn render(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<GeneratedImage> {
        cancel.check()?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        cancel.check()?;
        {
            let mut failures = self.fail_next.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::capability("image", "injected failure"));
            }
        }
        if let Some(trigger) = &self.policy_trigger {
            if request.prompt.contains(trigger.as_str()) {
                return Err(Error::content_policy("image", "prompt flagged"));
            }
        }
        self.history.lock().push(request.prompt.clone());
        Ok(GeneratedImage {
            image: ImageRef::new(format!(
                "mock://{}/{}",
                request.tag.iteration, request.tag.candidate_id
            )),
            metadata: serde_json::json!({
                "prompt": request.prompt,
                "seed": request.options.seed,
                "face_fix": request.options.face_fix,
            }),
        })
    }
}

#[async_trait]
impl ImageCapability for MockImage {
    fn locality(&self) -> Locality {
        self.locality
    }

    async fn status(&self) -> Result<CapabilityStatus> {
        Ok(CapabilityStatus::ready())
    }

    async fn generate_image(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<GeneratedImage> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.render(request, cancel).await
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn generate_images(
        &self,
        requests: &[ImageRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedImage>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut images = Vec::with_capacity(requests.len());
        for request in requests {
            images.push(self.render(request, cancel).await?);
        }
        Ok(images)
    }
}

/// A configurable mock vision capability.
///
/// The default comparison favors the image whose locator sorts lower,
/// which lines up with [`MockImage`]'s deterministic locators: lower
/// candidate ids win.
#[derive(Clone)]
pub struct MockVision {
    scoring: bool,
    max_images: usize,
    locality: Locality,
    latency: Option<Duration>,
    analyze_handler: Option<AnalyzeHandler>,
    compare_handler: Option<CompareHandler>,
    fail_next: Arc<Mutex<u32>>,
    analyze_calls: Arc<AtomicU64>,
    compare_calls: Arc<AtomicU64>,
}

impl std::fmt::Debug for MockVision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVision")
            .field("analyze_calls", &self.analyze_calls())
            .field("compare_calls", &self.compare_calls())
            .finish()
    }
}

impl Default for MockVision {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVision {
    /// Deterministic mock judge with scoring enabled and a 4-image
    /// comparison limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            scoring: true,
            max_images: 4,
            locality: Locality::Remote,
            latency: None,
            analyze_handler: None,
            compare_handler: None,
            fail_next: Arc::new(Mutex::new(0)),
            analyze_calls: Arc::new(AtomicU64::new(0)),
            compare_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Disable per-image scoring
    #[must_use]
    pub fn without_scoring(mut self) -> Self {
        self.scoring = false;
        self
    }

    /// Declare the multi-image comparison limit
    #[must_use]
    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images.max(2);
        self
    }

    /// Report the given locality
    #[must_use]
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// Sleep before every response
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Script per-image scores
    #[must_use]
    pub fn with_analyze_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ImageRef, &str) -> Result<ImageEvaluation> + Send + Sync + 'static,
    {
        self.analyze_handler = Some(Arc::new(handler));
        self
    }

    /// Script comparisons
    #[must_use]
    pub fn with_compare_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[ImageRef], &str) -> Result<ComparisonRanking> + Send + Sync + 'static,
    {
        self.compare_handler = Some(Arc::new(handler));
        self
    }

    /// Fail the next `count` calls with a capability error
    pub fn fail_next(&self, count: u32) {
        *self.fail_next.lock() = count;
    }

    /// Scoring calls made
    #[must_use]
    pub fn analyze_calls(&self) -> u64 {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    /// Comparison calls made
    #[must_use]
    pub fn compare_calls(&self) -> u64 {
        self.compare_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self, capability: &str) -> Result<()> {
        let mut failures = self.fail_next.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(Error::capability(capability, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl VisionCapability for MockVision {
    fn locality(&self) -> Locality {
        self.locality
    }

    async fn status(&self) -> Result<CapabilityStatus> {
        Ok(CapabilityStatus::ready())
    }

    fn supports_scoring(&self) -> bool {
        self.scoring
    }

    async fn analyze_image(
        &self,
        image: &ImageRef,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageEvaluation> {
        cancel.check()?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        cancel.check()?;
        self.check_failure("vision")?;
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        match &self.analyze_handler {
            Some(handler) => handler(image, prompt),
            None => Ok(ImageEvaluation {
                alignment: 80.0,
                aesthetic: 7.0,
            }),
        }
    }

    fn max_images_per_compare(&self) -> usize {
        self.max_images
    }

    async fn compare_images(
        &self,
        images: &[ImageRef],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<ComparisonRanking> {
        cancel.check()?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        cancel.check()?;
        self.check_failure("vision")?;
        self.compare_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(handler) = &self.compare_handler {
            return handler(images, prompt);
        }
        let mut order: Vec<usize> = (0..images.len()).collect();
        order.sort_by(|&a, &b| images[a].locator.cmp(&images[b].locator));
        Ok(ComparisonRanking {
            ranking: order
                .iter()
                .enumerate()
                .map(|(rank, &index)| RankedImage {
                    index,
                    rank: rank as u32 + 1,
                    reason: Some("preferred composition".to_string()),
                    ranks: None,
                })
                .collect(),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateKey;
    use crate::capability::ImageOptions;

    #[tokio::test]
    async fn test_mock_language_default_refine() {
        let language = MockLanguage::new();
        let response = language
            .refine_prompt(
                "a red fox",
                &RefineOptions {
                    dimension: PromptDimension::What,
                    temperature: 0.8,
                    max_tokens: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.text, "a red fox [what]");
        assert_eq!(language.refine_calls(), 1);
        assert_eq!(language.history(), vec!["a red fox"]);
    }

    #[tokio::test]
    async fn test_mock_language_fault_injection() {
        let language = MockLanguage::new();
        language.fail_next(1);
        let options = RefineOptions {
            dimension: PromptDimension::How,
            temperature: 0.8,
            max_tokens: None,
        };
        let cancel = CancellationToken::new();
        assert!(language
            .refine_prompt("p", &options, &cancel)
            .await
            .is_err());
        assert!(language.refine_prompt("p", &options, &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_language_policy_trigger() {
        let language = MockLanguage::new().with_policy_trigger("forbidden");
        let options = RefineOptions {
            dimension: PromptDimension::What,
            temperature: 0.8,
            max_tokens: None,
        };
        let result = language
            .refine_prompt("a forbidden scene", &options, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::ContentPolicy { .. })));
    }

    #[tokio::test]
    async fn test_mock_image_deterministic_locator() {
        let image = MockImage::new();
        let generated = image
            .generate_image(
                &ImageRequest {
                    prompt: "p".into(),
                    options: ImageOptions::default(),
                    tag: CandidateKey::new(1, 3),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(generated.image.locator, "mock://1/3");
        assert_eq!(image.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_vision_default_compare_prefers_lower_locator() {
        let vision = MockVision::new();
        let ranking = vision
            .compare_images(
                &[ImageRef::new("mock://0/1"), ImageRef::new("mock://0/0")],
                "p",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let winner = ranking.ranking.iter().find(|r| r.rank == 1).unwrap();
        assert_eq!(winner.index, 1);
        assert_eq!(vision.compare_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_vision_cancellation() {
        let vision = MockVision::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = vision
            .analyze_image(&ImageRef::new("mock://0/0"), "p", &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
