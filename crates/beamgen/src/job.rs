// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Job state, accounting, and the handle shared between the orchestrator
//! task and subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::candidate::Candidate;
use crate::capability::TokenUsage;
use crate::config::{CostTable, JobParams};

/// Unique identifier of a running orchestration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted, not yet running
    Queued,
    /// Orchestration in progress
    Running,
    /// Finished with a winner
    Completed,
    /// Stopped by cancellation
    Cancelled,
    /// Stopped by a fatal error
    Error,
}

impl JobState {
    /// Whether the job has reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Error
        )
    }
}

/// Accumulated token and cost counters for a job.
///
/// Updated only from the orchestrator's own execution, never from inside
/// capability calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUsage {
    /// Language tokens spent
    pub language_tokens: TokenUsage,
    /// Language calls issued
    pub language_calls: u64,
    /// Images generated (or attempted)
    pub image_calls: u64,
    /// Vision calls issued (scoring and comparisons)
    pub vision_calls: u64,
    /// Accumulated cost estimate in dollars
    pub estimated_cost: f64,
}

impl JobUsage {
    /// Total tokens across capabilities
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.language_tokens.total()
    }

    /// Token totals keyed by capability name, for event payloads
    #[must_use]
    pub fn tokens_by_capability(&self) -> HashMap<String, u64> {
        HashMap::from([("language".to_string(), self.language_tokens.total())])
    }

    /// Account one language call
    pub fn record_language(&mut self, usage: TokenUsage, cost: &CostTable) {
        self.language_tokens.add(usage);
        self.language_calls += 1;
        self.estimated_cost += usage.total() as f64 / 1000.0 * cost.language_per_1k_tokens;
    }

    /// Account `count` image generations
    pub fn record_image_calls(&mut self, count: u64, cost: &CostTable) {
        self.image_calls += count;
        self.estimated_cost += count as f64 * cost.image_per_call;
    }

    /// Account `count` vision calls
    pub fn record_vision_calls(&mut self, count: u64, cost: &CostTable) {
        self.vision_calls += count;
        self.estimated_cost += count as f64 * cost.vision_per_call;
    }
}

/// Serializable view of a job for reconnection and inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job id
    pub id: JobId,
    /// Session id surfaced in the `started` event
    pub session_id: Uuid,
    /// Current lifecycle state
    pub state: JobState,
    /// Parameters the job was submitted with
    pub params: JobParams,
    /// Submission time
    pub started_at: DateTime<Utc>,
    /// Iteration currently running (or last finished)
    pub current_iteration: u32,
    /// Every candidate produced so far, across iterations
    pub candidates: Vec<Candidate>,
    /// Accumulated counters
    pub usage: JobUsage,
}

/// Shared handle for one running orchestration.
///
/// The orchestrator task owns the writes; subscribers read snapshots.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    session_id: Uuid,
    params: JobParams,
    started_at: DateTime<Utc>,
    state: RwLock<JobState>,
    cancel: CancellationToken,
    current_iteration: AtomicU32,
    candidates: RwLock<Vec<Candidate>>,
    usage: Mutex<JobUsage>,
}

impl JobHandle {
    /// Handle for a freshly queued job
    #[must_use]
    pub fn new(params: JobParams) -> Self {
        Self {
            id: JobId::new(),
            session_id: Uuid::new_v4(),
            params,
            started_at: Utc::now(),
            state: RwLock::new(JobState::Queued),
            cancel: CancellationToken::new(),
            current_iteration: AtomicU32::new(0),
            candidates: RwLock::new(Vec::new()),
            usage: Mutex::new(JobUsage::default()),
        }
    }

    /// Job id
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Session id surfaced in the `started` event
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Submitted parameters
    #[must_use]
    pub fn params(&self) -> &JobParams {
        &self.params
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> JobState {
        *self.state.read()
    }

    /// Move to a new lifecycle state.
    ///
    /// Terminal states are sticky: once terminal, further transitions are
    /// ignored so a late cancel cannot overwrite a completed job.
    pub fn set_state(&self, state: JobState) {
        let mut current = self.state.write();
        if !current.is_terminal() {
            *current = state;
        }
    }

    /// The job's cancellation token
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Trip the job's cancellation token. Idempotent.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Iteration currently running
    #[must_use]
    pub fn current_iteration(&self) -> u32 {
        self.current_iteration.load(Ordering::SeqCst)
    }

    /// Record the iteration currently running
    pub fn set_current_iteration(&self, iteration: u32) {
        self.current_iteration.store(iteration, Ordering::SeqCst);
    }

    /// Append an iteration's candidates to the job history
    pub fn push_candidates(&self, candidates: &[Candidate]) {
        self.candidates.write().extend_from_slice(candidates);
    }

    /// Every candidate produced so far
    #[must_use]
    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates.read().clone()
    }

    /// Candidates of `iteration`, sorted by rank
    #[must_use]
    pub fn beam(&self, iteration: u32) -> Vec<Candidate> {
        let mut beam: Vec<Candidate> = self
            .candidates
            .read()
            .iter()
            .filter(|c| c.iteration == iteration)
            .cloned()
            .collect();
        beam.sort_by_key(|c| (c.rank.unwrap_or(u32::MAX), c.candidate_id));
        beam
    }

    /// Mutate the usage counters
    pub fn record_usage(&self, update: impl FnOnce(&mut JobUsage)) {
        update(&mut self.usage.lock());
    }

    /// Current usage counters
    #[must_use]
    pub fn usage(&self) -> JobUsage {
        *self.usage.lock()
    }

    /// Serializable view for reconnection
    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            session_id: self.session_id,
            state: self.state(),
            params: self.params.clone(),
            started_at: self.started_at,
            current_iteration: self.current_iteration(),
            candidates: self.candidates(),
            usage: self.usage(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ImageRef;
    use crate::candidate::CandidateMetadata;

    fn candidate(iteration: u32, id: u32, rank: Option<u32>) -> Candidate {
        Candidate {
            iteration,
            candidate_id: id,
            parent_id: None,
            what_prompt: String::new(),
            how_prompt: String::new(),
            combined_prompt: String::new(),
            image: ImageRef::new("blob://x"),
            evaluation: None,
            total_score: None,
            rank,
            reason: None,
            failed: false,
            metadata: CandidateMetadata::default(),
        }
    }

    #[test]
    fn test_usage_accounting() {
        let cost = CostTable {
            language_per_1k_tokens: 1.0,
            image_per_call: 0.5,
            vision_per_call: 0.25,
        };
        let mut usage = JobUsage::default();
        usage.record_language(
            TokenUsage {
                prompt_tokens: 600,
                completion_tokens: 400,
            },
            &cost,
        );
        usage.record_image_calls(2, &cost);
        usage.record_vision_calls(4, &cost);

        assert_eq!(usage.total_tokens(), 1000);
        assert_eq!(usage.language_calls, 1);
        assert_eq!(usage.image_calls, 2);
        assert_eq!(usage.vision_calls, 4);
        assert!((usage.estimated_cost - (1.0 + 1.0 + 1.0)).abs() < 1e-9);
        assert_eq!(usage.tokens_by_capability()["language"], 1000);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let handle = JobHandle::new(JobParams::new("p"));
        assert_eq!(handle.state(), JobState::Queued);
        handle.set_state(JobState::Running);
        handle.set_state(JobState::Completed);
        assert_eq!(handle.state(), JobState::Completed);
        handle.set_state(JobState::Cancelled);
        assert_eq!(handle.state(), JobState::Completed);
    }

    #[test]
    fn test_beam_sorted_by_rank() {
        let handle = JobHandle::new(JobParams::new("p"));
        handle.push_candidates(&[
            candidate(0, 0, Some(2)),
            candidate(0, 1, Some(1)),
            candidate(1, 0, Some(1)),
        ]);
        let beam = handle.beam(0);
        assert_eq!(beam.len(), 2);
        assert_eq!(beam[0].candidate_id, 1);
        assert_eq!(beam[1].candidate_id, 0);
    }

    #[test]
    fn test_snapshot_captures_counters() {
        let handle = JobHandle::new(JobParams::new("p"));
        handle.set_state(JobState::Running);
        handle.set_current_iteration(1);
        handle.record_usage(|u| u.image_calls = 3);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, JobState::Running);
        assert_eq!(snapshot.current_iteration, 1);
        assert_eq!(snapshot.usage.image_calls, 3);
        assert_eq!(snapshot.id, handle.id());
    }

    #[test]
    fn test_cancel_token_shared() {
        let handle = JobHandle::new(JobParams::new("p"));
        let token = handle.cancel_token();
        handle.request_cancel();
        assert!(token.is_cancelled());
    }
}
