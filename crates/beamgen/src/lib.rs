// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # beamgen
//!
//! Beam-search orchestration for prompt-refined image generation.
//!
//! Given a user prompt and a budget, beamgen explores a tree of prompt
//! variants: a language capability expands the prompt into WHAT (content)
//! and HOW (style) facets and combines them, an image capability renders
//! one image per leaf, and a vision capability comparatively ranks the
//! leaves. The top-M survive as parents of the next iteration.
//!
//! ## Architecture
//!
//! - [`orchestrator`] - the driving loop: expansion, refinement, leaf
//!   pipeline, failure containment, event emission
//! - [`ranker`] - total ordering from pairwise comparisons: one-shot
//!   multi-image ranking, all-pairs, or champion tournament with
//!   transitive inference
//! - [`ensemble`] - K-trial majority voting with position-bias mitigation
//! - [`graph`] - the pairwise comparison store and its transitive-chain
//!   search
//! - [`limiter`] - per-capability bounded concurrency with FIFO queueing
//!   and live retuning
//! - [`bundler`] - grouping of homogeneous language operations into
//!   batches
//! - [`events`] - per-job pub/sub with bounded replay for reconnection
//! - [`capability`] - the traits external providers implement
//! - [`testing`] - deterministic mock capabilities
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use beamgen::config::{JobParams, OrchestratorConfig};
//! use beamgen::orchestrator::{CapabilitySet, Orchestrator};
//! use beamgen::testing::{MockImage, MockLanguage, MockVision};
//!
//! #[tokio::main]
//! async fn main() -> beamgen::error::Result<()> {
//!     let orchestrator = Orchestrator::new(
//!         CapabilitySet::new(
//!             Arc::new(MockLanguage::new()),
//!             Arc::new(MockImage::new()),
//!             Arc::new(MockVision::new()),
//!         ),
//!         OrchestratorConfig::default(),
//!     )?;
//!
//!     let job_id = orchestrator.start_job(
//!         JobParams::new("a lighthouse at dusk")
//!             .with_beam_width(4)
//!             .with_keep_top(2)
//!             .with_max_iterations(3)
//!             .with_seed(42),
//!     )?;
//!
//!     let mut subscription = orchestrator.subscribe(job_id);
//!     while let Ok(event) = subscription.receiver.recv().await {
//!         println!("{:?}", event.payload);
//!         if event.payload.is_terminal() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod bundler;
pub mod cancel;
pub mod candidate;
pub mod capability;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod events;
pub mod graph;
pub mod job;
pub mod limiter;
pub mod orchestrator;
pub mod ranker;
pub mod retry;
pub mod testing;

/// Convenient re-exports for the common surface
pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::candidate::{Candidate, CandidateId, CandidateKey};
    pub use crate::capability::{
        CapabilityKind, ImageCapability, ImageRef, LanguageCapability, Locality, VisionCapability,
    };
    pub use crate::config::{Descriptiveness, JobParams, ModalOptions, OrchestratorConfig};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventPayload, JobEvent, JobSubscription};
    pub use crate::job::{JobId, JobSnapshot, JobState};
    pub use crate::orchestrator::{CapabilitySet, Orchestrator};
    pub use crate::ranker::{RankedCandidate, Ranker, RankerOptions};
}
