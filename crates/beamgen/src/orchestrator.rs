// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The beam-search driving loop.
//!
//! A job runs `max_iterations` rounds. Iteration 0 expands the user prompt
//! into `beam_width` WHAT/HOW pairs, combines them, renders one image per
//! leaf, optionally scores each image, and ranks the leaves. Every later
//! iteration does the same starting from the kept top-M parents (critique
//! seeded when the language capability supports it). All external calls
//! funnel through per-capability limiters; each phase submits its
//! operations up front and lets the limiter sequence them.
//!
//! Failure containment per leaf: transient capability failures retry with
//! backoff, content-policy rejections route through a bounded prompt
//! rewrite, and a persistently failed leaf becomes a placeholder ranked
//! last. Only a fully failed iteration (or cancellation) stops the job.
//! Every job emits exactly one terminal event: `complete`, `cancelled`, or
//! `error`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::bundler::{BundleResults, OperationId, PromptBundler, PromptOperation};
use crate::cancel::CancellationToken;
use crate::candidate::{Candidate, CandidateId, CandidateKey, CandidateMetadata};
use crate::capability::{
    CapabilityKind, GeneratedImage, ImageCapability, ImageEvaluation, ImageOptions, ImageRef,
    ImageRequest, LanguageCapability, LanguageResponse, PromptDimension, RefineOptions,
    RefineRequest, TokenUsage, VisionCapability,
};
use crate::config::{Descriptiveness, JobParams, OrchestratorConfig};
use crate::error::{Error, Result};
use crate::events::{
    CostReport, EventBus, EventPayload, JobEvent, JobSubscription, TokenReport, WinnerSummary,
};
use crate::job::{JobHandle, JobId, JobSnapshot, JobState};
use crate::limiter::{ConcurrencyLimiter, LimiterRegistry};
use crate::ranker::{ComparisonHook, RankEntry, Ranker, RankerOptions, RankingOutcome};
use crate::retry::with_retry;

/// The three capabilities a job orchestrates
#[derive(Clone)]
pub struct CapabilitySet {
    /// Prompt refinement and combination
    pub language: Arc<dyn LanguageCapability>,
    /// Image synthesis
    pub image: Arc<dyn ImageCapability>,
    /// Scoring and comparative ranking
    pub vision: Arc<dyn VisionCapability>,
}

impl CapabilitySet {
    /// Bundle three providers into a set
    #[must_use]
    pub fn new(
        language: Arc<dyn LanguageCapability>,
        image: Arc<dyn ImageCapability>,
        vision: Arc<dyn VisionCapability>,
    ) -> Self {
        Self {
            language,
            image,
            vision,
        }
    }
}

struct Inner {
    capabilities: CapabilitySet,
    config: OrchestratorConfig,
    limiters: LimiterRegistry,
    bus: EventBus,
    jobs: DashMap<JobId, Arc<JobHandle>>,
}

/// Beam-search orchestrator over a [`CapabilitySet`].
///
/// Clones share state; jobs run on spawned tasks and publish progress to
/// the embedded event bus.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use beamgen::orchestrator::{CapabilitySet, Orchestrator};
/// use beamgen::config::{JobParams, OrchestratorConfig};
/// use beamgen::testing::{MockImage, MockLanguage, MockVision};
///
/// #[tokio::main]
/// async fn main() -> beamgen::error::Result<()> {
///     let capabilities = CapabilitySet::new(
///         Arc::new(MockLanguage::new()),
///         Arc::new(MockImage::new()),
///         Arc::new(MockVision::new()),
///     );
///     let orchestrator = Orchestrator::new(capabilities, OrchestratorConfig::default())?;
///     let job_id = orchestrator.start_job(JobParams::new("a lighthouse at dusk"))?;
///     let mut subscription = orchestrator.subscribe(job_id);
///     while let Ok(event) = subscription.receiver.recv().await {
///         if event.payload.is_terminal() {
///             break;
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the config is inconsistent.
    pub fn new(capabilities: CapabilitySet, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let limiters = LimiterRegistry::new(config.limiter_policy);
        limiters.register(CapabilityKind::Language, capabilities.language.locality());
        limiters.register(CapabilityKind::Image, capabilities.image.locality());
        limiters.register(CapabilityKind::Vision, capabilities.vision.locality());
        let bus = EventBus::new(config.event_buffer);
        Ok(Self {
            inner: Arc::new(Inner {
                capabilities,
                config,
                limiters,
                bus,
                jobs: DashMap::new(),
            }),
        })
    }

    /// Retune the concurrency limit for one capability while jobs run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `limit` is zero.
    pub fn tune_limiter(&self, kind: CapabilityKind, limit: usize) -> Result<()> {
        self.inner.limiters.tune(kind, limit)
    }

    /// Validate `params`, register the job, and start it on a spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `params` violate the
    /// submission constraints.
    pub fn start_job(&self, params: JobParams) -> Result<JobId> {
        params.validate()?;
        let handle = Arc::new(JobHandle::new(params));
        let job_id = handle.id();
        self.inner.jobs.insert(job_id, Arc::clone(&handle));
        info!(%job_id, "job accepted");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_job(inner, handle).await;
        });
        Ok(job_id)
    }

    /// Trip a job's cancellation token. Idempotent; returns whether the job
    /// id is known.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        match self.inner.jobs.get(&job_id) {
            Some(handle) => {
                handle.request_cancel();
                true
            }
            None => false,
        }
    }

    /// Subscribe to a job's event stream, with buffered replay for late
    /// joiners.
    #[must_use]
    pub fn subscribe(&self, job_id: JobId) -> JobSubscription {
        self.inner.bus.subscribe(job_id)
    }

    /// Snapshot of a job's state, candidates, and counters
    #[must_use]
    pub fn job(&self, job_id: JobId) -> Option<JobSnapshot> {
        self.inner.jobs.get(&job_id).map(|handle| handle.snapshot())
    }

    /// Candidates of `iteration` for a job, sorted by rank
    #[must_use]
    pub fn beam(&self, job_id: JobId, iteration: u32) -> Option<Vec<Candidate>> {
        self.inner
            .jobs
            .get(&job_id)
            .map(|handle| handle.beam(iteration))
    }

    /// Drop a finished job and its event buffer
    pub fn remove_job(&self, job_id: JobId) {
        self.inner.jobs.remove(&job_id);
        self.inner.bus.remove_job(job_id);
    }
}

/// One leaf to produce during an iteration
struct LeafSeed {
    candidate_id: CandidateId,
    parent_id: Option<CandidateId>,
    base: String,
}

/// Prompts produced for one leaf
struct LeafPrompts {
    what: String,
    how: String,
    combined: String,
    usage: TokenUsage,
}

struct ResolvedTimeouts {
    language: Duration,
    image: Duration,
    vision: Duration,
}

/// Per-job execution context shared by the phase functions
struct JobContext {
    inner: Arc<Inner>,
    handle: Arc<JobHandle>,
    cancel: CancellationToken,
    seed: u64,
    rng: Mutex<StdRng>,
    timeouts: ResolvedTimeouts,
}

impl JobContext {
    fn params(&self) -> &JobParams {
        self.handle.params()
    }

    fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    fn emit(&self, payload: EventPayload) {
        self.inner
            .bus
            .publish(JobEvent::new(self.handle.id(), payload));
    }

    fn limiter(&self, kind: CapabilityKind) -> ConcurrencyLimiter {
        self.inner.limiters.get(kind)
    }

    fn record_language(&self, usage: TokenUsage) {
        let cost = self.config().cost;
        self.handle
            .record_usage(|u| u.record_language(usage, &cost));
    }

    fn record_image_calls(&self, count: u64) {
        let cost = self.config().cost;
        self.handle
            .record_usage(|u| u.record_image_calls(count, &cost));
    }

    fn record_vision_calls(&self, count: u64) {
        let cost = self.config().cost;
        self.handle
            .record_usage(|u| u.record_vision_calls(count, &cost));
    }

    /// Level for one combine, sampling when descriptiveness is random
    fn descriptiveness_level(&self) -> u8 {
        match self.params().descriptiveness {
            Descriptiveness::Level(level) => level,
            Descriptiveness::Random => self.rng.lock().gen_range(1..=3),
        }
    }

    fn refine_options(&self, dimension: PromptDimension) -> RefineOptions {
        RefineOptions {
            dimension,
            temperature: self.params().temperature,
            max_tokens: None,
        }
    }

    /// Refinement with retry but no content-policy rewrite; used by the
    /// rewrite path itself.
    async fn raw_refine(
        &self,
        text: &str,
        dimension: PromptDimension,
    ) -> Result<LanguageResponse> {
        let limiter = self.limiter(CapabilityKind::Language);
        let options = self.refine_options(dimension);
        let response = with_retry(&self.config().retries.language, || {
            timed(
                &limiter,
                self.timeouts.language,
                CapabilityKind::Language,
                self.inner
                    .capabilities
                    .language
                    .refine_prompt(text, &options, &self.cancel),
            )
        })
        .await?;
        self.record_language(response.usage);
        Ok(response)
    }

    /// Ask the language capability to rewrite a policy-flagged prompt
    async fn rewrite_flagged(&self, text: &str) -> Result<String> {
        debug!("rewriting content-policy-flagged prompt");
        let response = self.raw_refine(text, PromptDimension::What).await?;
        Ok(response.text)
    }

    /// One refinement with the full failure semantics (retry + bounded
    /// content-policy rewrite)
    async fn refine_op(
        &self,
        text: &str,
        dimension: PromptDimension,
    ) -> Result<LanguageResponse> {
        let mut text = text.to_string();
        let mut policy_budget = self.config().content_policy_retries;
        loop {
            match self.raw_refine(&text, dimension).await {
                Err(Error::ContentPolicy { .. }) if policy_budget > 0 => {
                    policy_budget -= 1;
                    text = self.rewrite_flagged(&text).await?;
                }
                other => return other,
            }
        }
    }

    /// One combine with the full failure semantics. A content-policy
    /// rejection rewrites the WHAT facet and recombines.
    async fn combine_op(
        &self,
        what: &str,
        how: &str,
        descriptiveness: u8,
    ) -> Result<LanguageResponse> {
        let limiter = self.limiter(CapabilityKind::Language);
        let options = crate::capability::CombineOptions { descriptiveness };
        let mut what = what.to_string();
        let mut policy_budget = self.config().content_policy_retries;
        loop {
            let attempt = with_retry(&self.config().retries.language, || {
                timed(
                    &limiter,
                    self.timeouts.language,
                    CapabilityKind::Language,
                    self.inner
                        .capabilities
                        .language
                        .combine_prompts(&what, how, &options, &self.cancel),
                )
            })
            .await;
            match attempt {
                Ok(response) => {
                    self.record_language(response.usage);
                    return Ok(response);
                }
                Err(Error::ContentPolicy { .. }) if policy_budget > 0 => {
                    policy_budget -= 1;
                    what = self.rewrite_flagged(&what).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One image generation with the full failure semantics. A
    /// content-policy rejection rewrites the combined prompt and resubmits.
    async fn generate_image_op(&self, mut request: ImageRequest) -> Result<GeneratedImage> {
        let limiter = self.limiter(CapabilityKind::Image);
        let mut policy_budget = self.config().content_policy_retries;
        loop {
            let attempt = with_retry(&self.config().retries.image, || {
                timed(
                    &limiter,
                    self.timeouts.image,
                    CapabilityKind::Image,
                    self.inner
                        .capabilities
                        .image
                        .generate_image(&request, &self.cancel),
                )
            })
            .await;
            match attempt {
                Ok(image) => {
                    self.record_image_calls(1);
                    return Ok(image);
                }
                Err(Error::ContentPolicy { .. }) if policy_budget > 0 => {
                    policy_budget -= 1;
                    request.prompt = self.rewrite_flagged(&request.prompt).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Score one image; scoring failures degrade to `None`
    async fn score_image(&self, image: &ImageRef, prompt: &str) -> Result<Option<ImageEvaluation>> {
        let limiter = self.limiter(CapabilityKind::Vision);
        let attempt = with_retry(&self.config().retries.vision, || {
            timed(
                &limiter,
                self.timeouts.vision,
                CapabilityKind::Vision,
                self.inner
                    .capabilities
                    .vision
                    .analyze_image(image, prompt, &self.cancel),
            )
        })
        .await;
        match attempt {
            Ok(evaluation) => {
                self.record_vision_calls(1);
                Ok(Some(evaluation))
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                warn!(error = %err, "image scoring failed, continuing without scores");
                Ok(None)
            }
        }
    }
}

/// Wrap a capability call with one limiter slot and the resolved timeout
async fn timed<T>(
    limiter: &ConcurrencyLimiter,
    timeout: Duration,
    capability: CapabilityKind,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    limiter
        .execute(async {
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(
                    capability.to_string(),
                    timeout.as_millis() as u64,
                )),
            }
        })
        .await
}

async fn run_job(inner: Arc<Inner>, handle: Arc<JobHandle>) {
    let job_id = handle.id();
    handle.set_state(JobState::Running);
    inner.bus.publish(JobEvent::new(
        job_id,
        EventPayload::Started {
            params: handle.params().clone(),
            session_id: handle.session_id(),
        },
    ));

    match run_search(&inner, &handle).await {
        Ok(winner) => {
            let usage = handle.usage();
            handle.set_state(JobState::Completed);
            info!(%job_id, iteration = winner.iteration, candidate = winner.candidate_id, "job complete");
            inner.bus.publish(JobEvent::new(
                job_id,
                EventPayload::Complete {
                    winner,
                    total_tokens: usage.total_tokens(),
                    total_cost: usage.estimated_cost,
                },
            ));
        }
        Err(Error::Cancelled) => {
            handle.set_state(JobState::Cancelled);
            info!(%job_id, "job cancelled");
            inner
                .bus
                .publish(JobEvent::new(job_id, EventPayload::Cancelled));
        }
        Err(err) => {
            handle.set_state(JobState::Error);
            warn!(%job_id, error = %err, "job failed");
            inner.bus.publish(JobEvent::new(
                job_id,
                EventPayload::Error {
                    message: err.to_string(),
                    details: None,
                    kind: err.kind().to_string(),
                },
            ));
        }
    }
}

async fn run_search(inner: &Arc<Inner>, handle: &Arc<JobHandle>) -> Result<WinnerSummary> {
    let params = handle.params().clone();
    let seed = params.seed.unwrap_or_else(rand::random);
    let ctx = JobContext {
        inner: Arc::clone(inner),
        handle: Arc::clone(handle),
        cancel: handle.cancel_token(),
        seed,
        rng: Mutex::new(StdRng::seed_from_u64(seed)),
        timeouts: resolve_timeouts(inner, handle).await,
    };

    let mut parents: Vec<Candidate> = Vec::new();
    let mut last_iteration = 0;
    for iteration in 0..params.max_iterations {
        ctx.cancel.check()?;
        ctx.handle.set_current_iteration(iteration);
        ctx.emit(EventPayload::Step {
            stage: "iteration".into(),
            status: "started".into(),
            message: format!("iteration {iteration} of {}", params.max_iterations),
        });

        let seeds = if iteration == 0 {
            (0..params.beam_width)
                .map(|i| LeafSeed {
                    candidate_id: i as CandidateId,
                    parent_id: None,
                    base: params.prompt.clone(),
                })
                .collect()
        } else {
            refinement_seeds(&ctx, iteration, &parents).await?
        };

        let mut candidates = run_iteration(&ctx, iteration, seeds).await?;
        rank_iteration(&ctx, iteration, &mut candidates).await?;
        ctx.handle.push_candidates(&candidates);

        let usage = ctx.handle.usage();
        ctx.emit(EventPayload::IterationComplete {
            iteration,
            token_usage: TokenReport::from(&usage),
            estimated_cost: CostReport {
                total: usage.estimated_cost,
            },
        });

        parents = ctx.handle.beam(iteration);
        parents.retain(|c| !c.failed);
        parents.truncate(params.keep_top);
        last_iteration = iteration;

        ctx.cancel.check()?;
    }

    let beam = ctx.handle.beam(last_iteration);
    let winner = beam
        .first()
        .ok_or_else(|| Error::AllLeavesFailed {
            iteration: last_iteration,
            count: params.beam_width,
        })?;
    Ok(WinnerSummary {
        iteration: winner.iteration,
        candidate_id: winner.candidate_id,
        score: winner.total_score,
    })
}

/// Probe each capability and pick cold vs warm timeouts. A failed probe is
/// treated as a cold provider.
async fn resolve_timeouts(inner: &Arc<Inner>, handle: &Arc<JobHandle>) -> ResolvedTimeouts {
    let timeouts = &inner.config.timeouts;
    let mut resolved = ResolvedTimeouts {
        language: timeouts.language.pick(false),
        image: timeouts.image.pick(false),
        vision: timeouts.vision.pick(false),
    };

    let probes: [(&str, Result<crate::capability::CapabilityStatus>); 3] = [
        ("language", inner.capabilities.language.status().await),
        ("image", inner.capabilities.image.status().await),
        ("vision", inner.capabilities.vision.status().await),
    ];
    for (name, probe) in probes {
        match probe {
            Ok(status) => {
                let budget = match name {
                    "language" => {
                        resolved.language = timeouts.language.pick(status.cached);
                        resolved.language
                    }
                    "image" => {
                        resolved.image = timeouts.image.pick(status.cached);
                        resolved.image
                    }
                    _ => {
                        resolved.vision = timeouts.vision.pick(status.cached);
                        resolved.vision
                    }
                };
                inner.bus.publish(JobEvent::new(
                    handle.id(),
                    EventPayload::Step {
                        stage: "status".into(),
                        status: "completed".into(),
                        message: format!(
                            "{name}: model_loaded={} cached={} timeout={}ms",
                            status.model_loaded,
                            status.cached,
                            budget.as_millis()
                        ),
                    },
                ));
            }
            Err(err) => {
                warn!(capability = name, error = %err, "status probe failed, assuming cold");
            }
        }
    }
    resolved
}

/// Build next-iteration seeds from the kept parents. Each parent yields
/// `beam_width / keep_top` children (earlier parents absorb the remainder),
/// critique-seeded when the language capability supports critiques.
async fn refinement_seeds(
    ctx: &JobContext,
    iteration: u32,
    parents: &[Candidate],
) -> Result<Vec<LeafSeed>> {
    if parents.is_empty() {
        return Err(Error::AllLeavesFailed {
            iteration: iteration - 1,
            count: ctx.params().beam_width,
        });
    }
    let beam_width = ctx.params().beam_width;
    let base_share = beam_width / parents.len();
    let remainder = beam_width % parents.len();

    // Critiques run sequentially through the language limiter anyway;
    // failures degrade to the parent's combined prompt.
    let mut bases: Vec<(CandidateId, String)> = Vec::with_capacity(parents.len());
    let supports_critique = ctx.inner.capabilities.language.supports_critique();
    for parent in parents {
        let base = if supports_critique {
            let limiter = ctx.limiter(CapabilityKind::Language);
            let attempt = with_retry(&ctx.config().retries.language, || {
                timed(
                    &limiter,
                    ctx.timeouts.language,
                    CapabilityKind::Language,
                    ctx.inner.capabilities.language.generate_critique(
                        &parent.image,
                        &ctx.params().prompt,
                        &ctx.cancel,
                    ),
                )
            })
            .await;
            match attempt {
                Ok(critique) => {
                    ctx.record_language(critique.usage);
                    format!("{}. {}", parent.combined_prompt, critique.text)
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    warn!(error = %err, "critique failed, reusing parent prompt");
                    parent.combined_prompt.clone()
                }
            }
        } else {
            parent.combined_prompt.clone()
        };
        bases.push((parent.candidate_id, base));
    }

    let mut seeds = Vec::with_capacity(beam_width);
    for (index, (parent_id, base)) in bases.iter().enumerate() {
        let share = base_share + usize::from(index < remainder);
        for _ in 0..share {
            seeds.push(LeafSeed {
                candidate_id: seeds.len() as CandidateId,
                parent_id: Some(*parent_id),
                base: base.clone(),
            });
        }
    }
    Ok(seeds)
}

/// Produce the iteration's candidates: expand, combine, render, score.
async fn run_iteration(
    ctx: &JobContext,
    iteration: u32,
    seeds: Vec<LeafSeed>,
) -> Result<Vec<Candidate>> {
    let expansions = expand_phase(ctx, iteration, &seeds).await?;
    let prompts = combine_phase(ctx, iteration, &seeds, expansions).await?;
    let images = image_phase(ctx, iteration, &seeds, &prompts).await?;
    let evaluations = score_phase(ctx, &prompts, &images).await?;

    let mut candidates = Vec::with_capacity(seeds.len());
    let mut failed = 0usize;
    for (index, seed) in seeds.iter().enumerate() {
        let prompts_ok = prompts[index].as_ref();
        let image_ok = images[index].as_ref();
        let mut candidate = Candidate {
            iteration,
            candidate_id: seed.candidate_id,
            parent_id: seed.parent_id,
            what_prompt: prompts_ok.map(|p| p.what.clone()).unwrap_or_default(),
            how_prompt: prompts_ok.map(|p| p.how.clone()).unwrap_or_default(),
            combined_prompt: prompts_ok
                .map(|p| p.combined.clone())
                .unwrap_or_else(|| seed.base.clone()),
            image: image_ok
                .map(|i| i.image.clone())
                .unwrap_or_default(),
            evaluation: None,
            total_score: None,
            rank: None,
            reason: None,
            failed: prompts_ok.is_none() || image_ok.is_none(),
            metadata: CandidateMetadata {
                generation: image_ok
                    .map(|i| i.metadata.clone())
                    .unwrap_or_default(),
                token_usage: prompts_ok.map(|p| p.usage).unwrap_or_default(),
            },
        };
        if let Some(evaluation) = evaluations[index] {
            candidate.set_evaluation(evaluation, ctx.params().alpha);
        }
        if candidate.failed {
            failed += 1;
            candidate.reason = Some("generation failed".to_string());
        }
        ctx.emit(EventPayload::CandidateComplete {
            iteration,
            candidate_id: candidate.candidate_id,
            parent_id: candidate.parent_id,
            what_prompt: candidate.what_prompt.clone(),
            how_prompt: candidate.how_prompt.clone(),
            combined: candidate.combined_prompt.clone(),
            image: candidate.image.clone(),
            evaluation: candidate.evaluation,
            total_score: candidate.total_score,
            failed: candidate.failed,
        });
        candidates.push(candidate);
    }

    if failed == candidates.len() {
        return Err(Error::AllLeavesFailed {
            iteration,
            count: failed,
        });
    }
    Ok(candidates)
}

/// Expand every seed into WHAT and HOW refinements via the bundler.
/// Returns per-leaf `(what, how, usage)`; `None` marks a failed leaf.
#[allow(clippy::type_complexity)]
async fn expand_phase(
    ctx: &JobContext,
    iteration: u32,
    seeds: &[LeafSeed],
) -> Result<Vec<Option<(String, String, TokenUsage)>>> {
    let n = seeds.len();
    let mut operations = Vec::with_capacity(n * 2);
    for (index, seed) in seeds.iter().enumerate() {
        operations.push(PromptOperation::expand(
            index as OperationId,
            PromptDimension::What,
            seed.base.clone(),
        ));
        operations.push(PromptOperation::expand(
            (n + index) as OperationId,
            PromptDimension::How,
            seed.base.clone(),
        ));
    }

    let bundler = PromptBundler::new(ctx.config().max_batch_size)?;
    let bundle = bundler.bundle(operations);
    debug!(
        iteration,
        batches = bundle.metadata.total_batches,
        operations = bundle.metadata.total_operations,
        "submitting expansion bundle"
    );

    let mut results = BundleResults::new();
    for batch in &bundle.batches {
        ctx.cancel.check()?;
        ctx.emit(EventPayload::Operation {
            iteration,
            kind: batch.kind.to_string(),
            count: batch.operations.len(),
            status: "submitted".into(),
        });

        let mut batch_handled = false;
        if ctx.inner.capabilities.language.supports_batch_refine() {
            if let Some(dimension) = batch.dimension {
                match submit_native_batch(ctx, batch.operations.as_slice(), dimension).await {
                    Ok(responses) => {
                        for (operation, response) in batch.operations.iter().zip(responses) {
                            ctx.record_language(response.usage);
                            results.insert(operation.id, response);
                        }
                        batch_handled = true;
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(err) => {
                        warn!(error = %err, "native batch refine failed, falling back to per-operation calls");
                    }
                }
            }
        }
        if !batch_handled {
            let outcomes =
                futures::future::join_all(batch.operations.iter().map(|operation| async {
                    let response = match &operation.input {
                        crate::bundler::OperationInput::Expand { dimension, prompt } => {
                            ctx.refine_op(prompt, *dimension).await
                        }
                        crate::bundler::OperationInput::Combine { .. } => {
                            Err(Error::invalid_argument(
                                "combine operation in expansion bundle",
                            ))
                        }
                    };
                    (operation.id, response)
                }))
                .await;
            for (id, outcome) in outcomes {
                match outcome {
                    Ok(response) => results.insert(id, response),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(err) => {
                        warn!(operation = id, error = %err, "expansion operation failed");
                    }
                }
            }
        }

        ctx.emit(EventPayload::Operation {
            iteration,
            kind: batch.kind.to_string(),
            count: batch.operations.len(),
            status: "completed".into(),
        });
    }

    let mut expansions = Vec::with_capacity(n);
    for index in 0..n {
        let what = results.get(index as OperationId);
        let how = results.get((n + index) as OperationId);
        expansions.push(match (what, how) {
            (Some(what), Some(how)) => {
                let mut usage = what.usage;
                usage.add(how.usage);
                Some((what.text.clone(), how.text.clone(), usage))
            }
            _ => None,
        });
    }
    Ok(expansions)
}

/// Submit one homogeneous expansion batch through the provider's native
/// batch endpoint.
async fn submit_native_batch(
    ctx: &JobContext,
    operations: &[PromptOperation],
    dimension: PromptDimension,
) -> Result<Vec<LanguageResponse>> {
    let requests: Vec<RefineRequest> = operations
        .iter()
        .filter_map(|operation| match &operation.input {
            crate::bundler::OperationInput::Expand { prompt, .. } => Some(RefineRequest {
                text: prompt.clone(),
                options: ctx.refine_options(dimension),
            }),
            crate::bundler::OperationInput::Combine { .. } => None,
        })
        .collect();
    let limiter = ctx.limiter(CapabilityKind::Language);
    let responses = with_retry(&ctx.config().retries.language, || {
        timed(
            &limiter,
            ctx.timeouts.language,
            CapabilityKind::Language,
            ctx.inner
                .capabilities
                .language
                .refine_batch(&requests, &ctx.cancel),
        )
    })
    .await?;
    if responses.len() != requests.len() {
        return Err(Error::capability(
            CapabilityKind::Language.to_string(),
            format!(
                "batch refine returned {} responses for {} requests",
                responses.len(),
                requests.len()
            ),
        ));
    }
    Ok(responses)
}

/// Pair WHAT[i] with HOW[i] and combine. Emits a `candidate` event per
/// successful leaf.
async fn combine_phase(
    ctx: &JobContext,
    iteration: u32,
    seeds: &[LeafSeed],
    expansions: Vec<Option<(String, String, TokenUsage)>>,
) -> Result<Vec<Option<LeafPrompts>>> {
    ctx.cancel.check()?;
    // Sample levels up front so the seeded RNG is consumed in leaf order
    // regardless of completion order.
    let levels: Vec<u8> = seeds.iter().map(|_| ctx.descriptiveness_level()).collect();

    let outcomes = futures::future::join_all(expansions.iter().zip(&levels).map(
        |(expansion, &level)| async move {
            match expansion {
                None => None,
                Some((what, how, usage)) => {
                    Some((ctx.combine_op(what, how, level).await, what, how, *usage))
                }
            }
        },
    ))
    .await;

    let mut prompts = Vec::with_capacity(seeds.len());
    for (seed, outcome) in seeds.iter().zip(outcomes) {
        match outcome {
            None => prompts.push(None),
            Some((Err(Error::Cancelled), _, _, _)) => return Err(Error::Cancelled),
            Some((Err(err), _, _, _)) => {
                warn!(candidate = seed.candidate_id, error = %err, "combine failed");
                prompts.push(None);
            }
            Some((Ok(response), what, how, mut usage)) => {
                usage.add(response.usage);
                ctx.emit(EventPayload::Candidate {
                    iteration,
                    candidate_id: seed.candidate_id,
                    parent_id: seed.parent_id,
                    what_prompt: what.clone(),
                    how_prompt: how.clone(),
                    combined: response.text.clone(),
                });
                prompts.push(Some(LeafPrompts {
                    what: what.clone(),
                    how: how.clone(),
                    combined: response.text,
                    usage,
                }));
            }
        }
    }
    Ok(prompts)
}

/// Render one image per leaf, batched when the provider supports it.
async fn image_phase(
    ctx: &JobContext,
    iteration: u32,
    seeds: &[LeafSeed],
    prompts: &[Option<LeafPrompts>],
) -> Result<Vec<Option<GeneratedImage>>> {
    ctx.cancel.check()?;
    ctx.emit(EventPayload::Step {
        stage: "image-generation".into(),
        status: "started".into(),
        message: format!(
            "rendering {} images",
            prompts.iter().filter(|p| p.is_some()).count()
        ),
    });

    // Negative prompt derived once per leaf when enabled and supported.
    let negative = negative_prompts(ctx, prompts).await?;

    let modal = ctx.params().modal;
    let requests: Vec<(usize, ImageRequest)> = prompts
        .iter()
        .enumerate()
        .filter_map(|(index, prompt)| {
            prompt.as_ref().map(|p| {
                (
                    index,
                    ImageRequest {
                        prompt: p.combined.clone(),
                        options: ImageOptions {
                            seed: ctx.params().seed.map(|s| {
                                s.wrapping_add(u64::from(iteration))
                                    .wrapping_add(u64::from(seeds[index].candidate_id))
                            }),
                            negative_prompt: negative[index].clone(),
                            face_fix: modal.face_fix,
                            guidance_scale: modal.guidance_scale,
                            steps: modal.steps,
                        },
                        tag: CandidateKey::new(iteration, seeds[index].candidate_id),
                    },
                )
            })
        })
        .collect();

    let mut images: Vec<Option<GeneratedImage>> = vec![None; prompts.len()];
    if requests.is_empty() {
        return Ok(images);
    }

    if ctx.inner.capabilities.image.supports_batch() && requests.len() > 1 {
        let batch: Vec<ImageRequest> = requests.iter().map(|(_, r)| r.clone()).collect();
        let limiter = ctx.limiter(CapabilityKind::Image);
        let attempt = with_retry(&ctx.config().retries.image, || {
            timed(
                &limiter,
                ctx.timeouts.image,
                CapabilityKind::Image,
                ctx.inner
                    .capabilities
                    .image
                    .generate_images(&batch, &ctx.cancel),
            )
        })
        .await;
        match attempt {
            Ok(generated) if generated.len() == batch.len() => {
                ctx.record_image_calls(generated.len() as u64);
                for ((index, _), image) in requests.iter().zip(generated) {
                    images[*index] = Some(image);
                }
                ctx.emit(EventPayload::Step {
                    stage: "image-generation".into(),
                    status: "completed".into(),
                    message: format!("rendered {} images in one batch", batch.len()),
                });
                return Ok(images);
            }
            Ok(generated) => {
                warn!(
                    expected = batch.len(),
                    got = generated.len(),
                    "batch image response misaligned, falling back to per-leaf generation"
                );
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!(error = %err, "batch image generation failed, falling back to per-leaf generation");
            }
        }
    }

    let outcomes = futures::future::join_all(
        requests
            .iter()
            .map(|(index, request)| async move {
                (*index, ctx.generate_image_op(request.clone()).await)
            }),
    )
    .await;
    for (index, outcome) in outcomes {
        match outcome {
            Ok(image) => images[index] = Some(image),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!(leaf = index, error = %err, "image generation failed for leaf");
            }
        }
    }
    ctx.emit(EventPayload::Step {
        stage: "image-generation".into(),
        status: "completed".into(),
        message: format!(
            "rendered {} of {} images",
            images.iter().filter(|i| i.is_some()).count(),
            requests.len()
        ),
    });
    Ok(images)
}

/// Derive negative prompts for each leaf when enabled and supported.
/// Failures degrade to no negative prompt.
async fn negative_prompts(
    ctx: &JobContext,
    prompts: &[Option<LeafPrompts>],
) -> Result<Vec<Option<String>>> {
    let enabled = ctx.params().modal.negative_prompt
        && ctx.inner.capabilities.language.supports_negative_prompt();
    if !enabled {
        return Ok(vec![None; prompts.len()]);
    }

    let limiter = ctx.limiter(CapabilityKind::Language);
    let outcomes = futures::future::join_all(prompts.iter().map(|prompt| {
        let limiter = limiter.clone();
        async move {
            let Some(prompt) = prompt else { return Ok(None) };
            let attempt = with_retry(&ctx.config().retries.language, || {
                timed(
                    &limiter,
                    ctx.timeouts.language,
                    CapabilityKind::Language,
                    ctx.inner
                        .capabilities
                        .language
                        .generate_negative_prompt(&prompt.combined, &ctx.cancel),
                )
            })
            .await;
            match attempt {
                Ok(response) => {
                    ctx.record_language(response.usage);
                    Ok(Some(response.text))
                }
                Err(Error::Cancelled) => Err(Error::Cancelled),
                Err(err) => {
                    warn!(error = %err, "negative prompt generation failed, continuing without");
                    Ok(None)
                }
            }
        }
    }))
    .await;

    let mut negatives = Vec::with_capacity(prompts.len());
    for outcome in outcomes {
        negatives.push(outcome?);
    }
    Ok(negatives)
}

/// Score each rendered leaf when scoring is enabled and supported.
async fn score_phase(
    ctx: &JobContext,
    prompts: &[Option<LeafPrompts>],
    images: &[Option<GeneratedImage>],
) -> Result<Vec<Option<ImageEvaluation>>> {
    let enabled =
        ctx.config().enable_scoring && ctx.inner.capabilities.vision.supports_scoring();
    if !enabled {
        return Ok(vec![None; images.len()]);
    }
    ctx.cancel.check()?;

    let outcomes = futures::future::join_all(images.iter().zip(prompts).map(
        |(image, prompt)| async move {
            match (image, prompt) {
                (Some(image), Some(prompt)) => {
                    ctx.score_image(&image.image, &prompt.combined).await
                }
                _ => Ok(None),
            }
        },
    ))
    .await;

    let mut evaluations = Vec::with_capacity(images.len());
    for outcome in outcomes {
        evaluations.push(outcome?);
    }
    Ok(evaluations)
}

/// Rank the iteration's healthy leaves and assign ranks in place; failed
/// leaves take the last ranks.
async fn rank_iteration(
    ctx: &JobContext,
    iteration: u32,
    candidates: &mut [Candidate],
) -> Result<()> {
    let entries: Vec<RankEntry> = candidates
        .iter()
        .filter(|c| !c.failed)
        .map(|c| RankEntry {
            id: c.candidate_id,
            image: c.image.clone(),
        })
        .collect();

    let hook: ComparisonHook = {
        let inner = Arc::clone(&ctx.inner);
        let job_id = ctx.handle.id();
        Arc::new(move |event| {
            inner.bus.publish(JobEvent::new(
                job_id,
                EventPayload::RankingComparison {
                    iteration,
                    id_a: event.id_a,
                    id_b: event.id_b,
                    winner: event.winner,
                    reason: event.reason,
                },
            ));
        })
    };

    let ranker = Ranker::new(
        Arc::clone(&ctx.inner.capabilities.vision),
        ctx.limiter(CapabilityKind::Vision),
        RankerOptions {
            keep_top: ctx.params().keep_top,
            ensemble_size: ctx.params().ensemble_size,
            all_at_once_threshold: ctx.config().all_at_once_threshold,
            all_pairs_max: ctx.config().all_pairs_max,
        },
    )?
    .with_seed(ctx.seed.wrapping_add(u64::from(iteration)))
    .with_timeout(ctx.timeouts.vision)
    .with_comparison_hook(hook);

    let outcome: RankingOutcome = ranker
        .rank(&entries, &ctx.params().prompt, &ctx.cancel)
        .await?;
    ctx.record_vision_calls(match outcome.strategy {
        crate::ranker::RankStrategy::AllAtOnce => 1,
        _ => u64::from(outcome.comparisons) * ctx.params().ensemble_size as u64,
    });

    let mut order: Vec<CandidateId> = Vec::with_capacity(candidates.len());
    for ranked in &outcome.ordered {
        order.push(ranked.candidate_id);
        if let Some(candidate) = candidates
            .iter_mut()
            .find(|c| c.candidate_id == ranked.candidate_id)
        {
            candidate.rank = Some(ranked.rank);
            candidate.reason = ranked.reason.clone();
        }
    }

    // Failed leaves close out the order, lowest ranks, id ascending.
    let mut next_rank = outcome.ordered.len() as u32 + 1;
    let mut failed_ids: Vec<CandidateId> = candidates
        .iter()
        .filter(|c| c.failed)
        .map(|c| c.candidate_id)
        .collect();
    failed_ids.sort_unstable();
    for id in failed_ids {
        if let Some(candidate) = candidates.iter_mut().find(|c| c.candidate_id == id) {
            candidate.rank = Some(next_rank);
            next_rank += 1;
            order.push(id);
        }
    }

    ctx.emit(EventPayload::RankingComplete { iteration, order });
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockImage, MockLanguage, MockVision};

    fn orchestrator_with(
        language: MockLanguage,
        image: MockImage,
        vision: MockVision,
    ) -> Orchestrator {
        Orchestrator::new(
            CapabilitySet::new(Arc::new(language), Arc::new(image), Arc::new(vision)),
            OrchestratorConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_params_rejected_at_submission() {
        let orchestrator =
            orchestrator_with(MockLanguage::new(), MockImage::new(), MockVision::new());
        let result = orchestrator.start_job(JobParams::new("p").with_alpha(2.0));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_cancel_unknown_job_is_noop() {
        let orchestrator =
            orchestrator_with(MockLanguage::new(), MockImage::new(), MockVision::new());
        assert!(!orchestrator.cancel_job(JobId::new()));
    }

    #[tokio::test]
    async fn test_limiter_tuning_applies_while_running() {
        let orchestrator =
            orchestrator_with(MockLanguage::new(), MockImage::new(), MockVision::new());
        orchestrator
            .tune_limiter(CapabilityKind::Language, 8)
            .unwrap();
        assert!(orchestrator
            .tune_limiter(CapabilityKind::Language, 0)
            .is_err());
    }
}
