// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-process publish/subscribe for job progress events.
//!
//! Events are keyed by job. Per-job delivery follows publish order;
//! ordering across jobs is unspecified. Each job keeps a bounded replay
//! buffer so late subscribers (reconnections) can catch up before tailing
//! the live stream.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::candidate::CandidateId;
use crate::capability::{ImageEvaluation, ImageRef};
use crate::config::JobParams;
use crate::graph::Winner;
use crate::job::{JobId, JobUsage};

/// Capacity of the per-job broadcast channel feeding live subscribers
const BROADCAST_CAPACITY: usize = 1024;

/// Winning candidate reported by the `complete` event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WinnerSummary {
    /// Iteration the winner came from
    pub iteration: u32,
    /// Winner's candidate id
    pub candidate_id: CandidateId,
    /// Winner's total score, when scoring ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Token totals reported by `iteration-complete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenReport {
    /// Tokens across all capabilities
    pub total: u64,
    /// Tokens keyed by capability name
    pub by_capability: std::collections::HashMap<String, u64>,
}

/// Cost totals reported by `iteration-complete`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    /// Accumulated cost estimate in dollars
    pub total: f64,
}

impl From<&JobUsage> for TokenReport {
    fn from(usage: &JobUsage) -> Self {
        Self {
            total: usage.total_tokens(),
            by_capability: usage.tokens_by_capability(),
        }
    }
}

/// Event payloads, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    /// Job accepted and starting
    Started {
        /// Submitted parameters
        params: JobParams,
        /// Session id for artifact storage
        session_id: Uuid,
    },
    /// Coarse progress through a phase
    Step {
        /// Phase name, e.g. "expansion", "image-generation"
        stage: String,
        /// "started", "completed", "degraded", ...
        status: String,
        /// Human-readable detail
        message: String,
    },
    /// A bundled language batch moved state
    Operation {
        /// Iteration the batch belongs to
        iteration: u32,
        /// Batch kind, e.g. "expand-what"
        kind: String,
        /// Operations in the batch
        count: usize,
        /// "submitted" or "completed"
        status: String,
    },
    /// A candidate's prompts are ready
    Candidate {
        /// Iteration
        iteration: u32,
        /// Candidate id
        candidate_id: CandidateId,
        /// Parent in the previous iteration
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<CandidateId>,
        /// Content facet
        what_prompt: String,
        /// Style facet
        how_prompt: String,
        /// Merged prompt
        combined: String,
    },
    /// A candidate finished its leaf pipeline (image, optional scores)
    CandidateComplete {
        /// Iteration
        iteration: u32,
        /// Candidate id
        candidate_id: CandidateId,
        /// Parent in the previous iteration
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<CandidateId>,
        /// Content facet
        what_prompt: String,
        /// Style facet
        how_prompt: String,
        /// Merged prompt
        combined: String,
        /// The generated image
        image: ImageRef,
        /// Scores, when scoring ran
        #[serde(skip_serializing_if = "Option::is_none")]
        evaluation: Option<ImageEvaluation>,
        /// Weighted total, when scored
        #[serde(skip_serializing_if = "Option::is_none")]
        total_score: Option<f64>,
        /// Set when the leaf persistently failed
        #[serde(default)]
        failed: bool,
    },
    /// One real pairwise comparison landed
    RankingComparison {
        /// Iteration
        iteration: u32,
        /// First candidate
        id_a: CandidateId,
        /// Second candidate
        id_b: CandidateId,
        /// Outcome relative to `(id_a, id_b)`
        winner: Winner,
        /// Provider reasoning, when given
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The iteration's total order is known
    RankingComplete {
        /// Iteration
        iteration: u32,
        /// Candidate ids, rank 1 first
        order: Vec<CandidateId>,
    },
    /// An iteration finished and the beam was kept
    IterationComplete {
        /// Iteration
        iteration: u32,
        /// Accumulated token counters
        token_usage: TokenReport,
        /// Accumulated cost estimate
        estimated_cost: CostReport,
    },
    /// Terminal: the job finished with a winner
    Complete {
        /// Rank-1 candidate of the final iteration
        winner: WinnerSummary,
        /// Total tokens spent
        total_tokens: u64,
        /// Total estimated cost
        total_cost: f64,
    },
    /// Terminal: the job failed
    Error {
        /// Human-readable message
        message: String,
        /// Extra detail, when available
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        /// Stable error kind tag
        kind: String,
    },
    /// Terminal: the job was cancelled
    Cancelled,
}

impl EventPayload {
    /// Whether this payload ends the job's stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::Complete { .. } | EventPayload::Error { .. } | EventPayload::Cancelled
        )
    }
}

/// One event on a job's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job the event belongs to
    pub job_id: JobId,
    /// Publish time
    pub timestamp: DateTime<Utc>,
    /// Payload, tagged by `type` on the wire
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl JobEvent {
    /// Event for `job_id` stamped now
    #[must_use]
    pub fn new(job_id: JobId, payload: EventPayload) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

struct JobChannel {
    sender: broadcast::Sender<JobEvent>,
    buffer: Mutex<VecDeque<JobEvent>>,
}

impl JobChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            buffer: Mutex::new(VecDeque::new()),
        }
    }
}

/// A late subscriber's view: buffered history plus the live stream
pub struct JobSubscription {
    /// Buffered events up to the subscription instant, in publish order
    pub replay: Vec<JobEvent>,
    /// Live events from the subscription instant on
    pub receiver: broadcast::Receiver<JobEvent>,
}

impl JobSubscription {
    /// Replay followed by the live stream as one sequence.
    ///
    /// Subscribers that fall more than the channel capacity behind skip the
    /// lagged span and continue with newer events.
    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send {
        futures::stream::iter(self.replay)
            .chain(BroadcastStream::new(self.receiver).filter_map(|item| async { item.ok() }))
    }
}

/// Per-job pub/sub with bounded replay.
///
/// Multi-reader, single-writer per job: the orchestrator task is the only
/// publisher for its job id.
pub struct EventBus {
    jobs: DashMap<JobId, Arc<JobChannel>>,
    buffer_capacity: usize,
}

impl EventBus {
    /// Bus buffering up to `buffer_capacity` events per job for replay
    #[must_use]
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            buffer_capacity: buffer_capacity.max(1),
        }
    }

    fn channel(&self, job_id: JobId) -> Arc<JobChannel> {
        self.jobs
            .entry(job_id)
            .or_insert_with(|| Arc::new(JobChannel::new()))
            .clone()
    }

    /// Publish an event to its job's stream.
    ///
    /// The buffer lock serializes publish against subscribe, so a late
    /// subscriber sees every event exactly once across replay + live.
    pub fn publish(&self, event: JobEvent) {
        let channel = self.channel(event.job_id);
        let mut buffer = channel.buffer.lock();
        if buffer.len() == self.buffer_capacity {
            buffer.pop_front();
        }
        buffer.push_back(event.clone());
        // No receivers is fine; the buffer still serves replay.
        let _ = channel.sender.send(event);
    }

    /// Subscribe to a job's stream, receiving buffered history first.
    #[must_use]
    pub fn subscribe(&self, job_id: JobId) -> JobSubscription {
        let channel = self.channel(job_id);
        let buffer = channel.buffer.lock();
        JobSubscription {
            replay: buffer.iter().cloned().collect(),
            receiver: channel.sender.subscribe(),
        }
    }

    /// Number of buffered events for a job
    #[must_use]
    pub fn buffered(&self, job_id: JobId) -> usize {
        self.jobs
            .get(&job_id)
            .map_or(0, |channel| channel.buffer.lock().len())
    }

    /// Drop a job's channel and buffer
    pub fn remove_job(&self, job_id: JobId) {
        self.jobs.remove(&job_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn step(job_id: JobId, n: usize) -> JobEvent {
        JobEvent::new(
            job_id,
            EventPayload::Step {
                stage: "expansion".into(),
                status: "started".into(),
                message: format!("step {n}"),
            },
        )
    }

    #[test]
    fn test_event_type_tag_on_wire() {
        let event = JobEvent::new(JobId::new(), EventPayload::Cancelled);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cancelled");
        assert!(json["job_id"].is_string());
        assert!(json["timestamp"].is_string());

        let event = step(JobId::new(), 1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step");
        assert_eq!(json["stage"], "expansion");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EventPayload::Cancelled.is_terminal());
        assert!(EventPayload::Error {
            message: "m".into(),
            details: None,
            kind: "capability-failure".into()
        }
        .is_terminal());
        assert!(!EventPayload::Step {
            stage: "s".into(),
            status: "started".into(),
            message: String::new()
        }
        .is_terminal());
    }

    #[tokio::test]
    async fn test_subscribe_before_publish_receives_live() {
        let bus = EventBus::default();
        let job_id = JobId::new();
        let mut subscription = bus.subscribe(job_id);
        assert!(subscription.replay.is_empty());

        bus.publish(step(job_id, 1));
        let received = subscription.receiver.recv().await.unwrap();
        assert_eq!(received.payload, step(job_id, 1).payload);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_history() {
        let bus = EventBus::default();
        let job_id = JobId::new();
        for n in 0..5 {
            bus.publish(step(job_id, n));
        }

        let subscription = bus.subscribe(job_id);
        assert_eq!(subscription.replay.len(), 5);
        bus.publish(step(job_id, 5));

        let events: Vec<JobEvent> = subscription
            .into_stream()
            .take(6)
            .collect::<Vec<_>>()
            .await;
        for (n, event) in events.iter().enumerate() {
            assert_eq!(event.payload, step(job_id, n).payload);
        }
    }

    #[test]
    fn test_buffer_is_bounded() {
        let bus = EventBus::new(3);
        let job_id = JobId::new();
        for n in 0..10 {
            bus.publish(step(job_id, n));
        }
        assert_eq!(bus.buffered(job_id), 3);
        let subscription = bus.subscribe(job_id);
        // Oldest events were dropped; the last three remain.
        let messages: Vec<String> = subscription
            .replay
            .iter()
            .map(|e| match &e.payload {
                EventPayload::Step { message, .. } => message.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(messages, vec!["step 7", "step 8", "step 9"]);
    }

    #[test]
    fn test_streams_are_independent_per_job() {
        let bus = EventBus::default();
        let job_a = JobId::new();
        let job_b = JobId::new();
        bus.publish(step(job_a, 1));
        bus.publish(step(job_b, 2));

        assert_eq!(bus.buffered(job_a), 1);
        assert_eq!(bus.buffered(job_b), 1);
        assert_eq!(bus.subscribe(job_a).replay.len(), 1);
    }

    #[test]
    fn test_remove_job_drops_buffer() {
        let bus = EventBus::default();
        let job_id = JobId::new();
        bus.publish(step(job_id, 1));
        bus.remove_job(job_id);
        assert_eq!(bus.buffered(job_id), 0);
    }
}
