// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! End-to-end orchestration tests over the mock capabilities.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use beamgen::capability::Locality;
use beamgen::config::{CapabilityRetries, JobParams, ModalOptions, OrchestratorConfig};
use beamgen::events::{EventPayload, JobEvent};
use beamgen::job::{JobId, JobState};
use beamgen::orchestrator::{CapabilitySet, Orchestrator};
use beamgen::retry::RetryPolicy;
use beamgen::testing::{MockImage, MockLanguage, MockVision};

fn orchestrator_with(
    language: &MockLanguage,
    image: &MockImage,
    vision: &MockVision,
    config: OrchestratorConfig,
) -> Orchestrator {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Orchestrator::new(
        CapabilitySet::new(
            Arc::new(language.clone()),
            Arc::new(image.clone()),
            Arc::new(vision.clone()),
        ),
        config,
    )
    .unwrap()
}

/// Collect a job's full event stream, replay included, until the terminal
/// event.
async fn collect_events(orchestrator: &Orchestrator, job_id: JobId) -> Vec<JobEvent> {
    let subscription = orchestrator.subscribe(job_id);
    let mut stream = Box::pin(subscription.into_stream());
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("event stream stalled")
            .expect("event stream closed before terminal event");
        let terminal = event.payload.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

fn count_matching(events: &[JobEvent], predicate: impl Fn(&EventPayload) -> bool) -> usize {
    events.iter().filter(|e| predicate(&e.payload)).count()
}

#[tokio::test]
async fn test_full_orchestration_two_iterations() {
    let language = MockLanguage::new();
    let image = MockImage::new();
    let vision = MockVision::new();
    let orchestrator =
        orchestrator_with(&language, &image, &vision, OrchestratorConfig::default());

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(2)
                .with_seed(7),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;

    // Exactly one started, two iteration-complete, one terminal complete.
    assert_eq!(
        count_matching(&events, |p| matches!(p, EventPayload::Started { .. })),
        1
    );
    assert_eq!(
        count_matching(&events, |p| matches!(
            p,
            EventPayload::IterationComplete { .. }
        )),
        2
    );
    assert_eq!(
        count_matching(&events, |p| p.is_terminal()),
        1
    );

    // The winner is rank 1 of the final iteration; the default mock vision
    // prefers lower candidate ids.
    let Some(EventPayload::Complete {
        winner,
        total_tokens,
        total_cost,
    }) = events.last().map(|e| &e.payload)
    else {
        panic!("final event was not complete: {:?}", events.last());
    };
    assert_eq!(winner.iteration, 1);
    assert_eq!(winner.candidate_id, 0);
    // Default mock scores: 0.7 * 80 + 0.3 * 70 = 77.
    assert!((winner.score.unwrap() - 77.0).abs() < 1e-9);
    assert!(*total_tokens > 0);
    assert!(*total_cost > 0.0);

    // iteration-complete(0) precedes every iteration-1 event.
    let first_iteration_complete = events
        .iter()
        .position(|e| {
            matches!(
                e.payload,
                EventPayload::IterationComplete { iteration: 0, .. }
            )
        })
        .unwrap();
    let first_iteration_one = events
        .iter()
        .position(|e| match &e.payload {
            EventPayload::Candidate { iteration, .. }
            | EventPayload::CandidateComplete { iteration, .. }
            | EventPayload::RankingComparison { iteration, .. }
            | EventPayload::RankingComplete { iteration, .. } => *iteration == 1,
            _ => false,
        })
        .unwrap();
    assert!(first_iteration_complete < first_iteration_one);

    // Four candidates total (two per iteration), none failed.
    let snapshot = orchestrator.job(job_id).unwrap();
    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!(snapshot.candidates.len(), 4);
    assert!(snapshot.candidates.iter().all(|c| !c.failed));
    assert!(snapshot
        .candidates
        .iter()
        .filter(|c| c.iteration == 1)
        .all(|c| c.parent_id == Some(0)));

    // N=2 fits the all-at-once path: one comparison call per iteration,
    // plus per-leaf scoring.
    assert_eq!(vision.compare_calls(), 2);
    assert_eq!(vision.analyze_calls(), 4);
}

#[tokio::test]
async fn test_cancellation_mid_iteration() {
    let language = MockLanguage::new();
    let image = MockImage::new().with_latency(Duration::from_millis(150));
    let vision = MockVision::new();
    let orchestrator =
        orchestrator_with(&language, &image, &vision, OrchestratorConfig::default());

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(2)
                .with_seed(7),
        )
        .unwrap();

    let subscription = orchestrator.subscribe(job_id);
    let mut stream = Box::pin(subscription.into_stream());
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("event stream stalled")
            .expect("event stream closed before terminal event");
        if matches!(
            event.payload,
            EventPayload::IterationComplete { iteration: 0, .. }
        ) {
            // Iteration 1 is about to enter image generation.
            assert!(orchestrator.cancel_job(job_id));
        }
        let terminal = event.payload.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }

    assert_eq!(
        count_matching(&events, |p| matches!(p, EventPayload::Cancelled)),
        1
    );
    assert_eq!(count_matching(&events, |p| p.is_terminal()), 1);
    // No leaf of iteration 1 completed after the cancel.
    assert_eq!(
        count_matching(&events, |p| matches!(
            p,
            EventPayload::CandidateComplete { iteration: 1, .. }
        )),
        0
    );
    assert_eq!(orchestrator.job(job_id).unwrap().state, JobState::Cancelled);

    // cancel_job is idempotent.
    assert!(orchestrator.cancel_job(job_id));
}

#[tokio::test]
async fn test_failed_leaf_becomes_last_ranked_placeholder() {
    let language = MockLanguage::new();
    let image = MockImage::new();
    let vision = MockVision::new();
    // No image retries, so the single injected failure downs exactly the
    // first leaf through the width-1 local image limiter.
    image.fail_next(1);
    let config = OrchestratorConfig {
        retries: CapabilityRetries {
            image: RetryPolicy::None,
            ..CapabilityRetries::default()
        },
        ..OrchestratorConfig::default()
    };
    let orchestrator = orchestrator_with(&language, &image, &vision, config);

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(1)
                .with_seed(7),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;

    let Some(EventPayload::Complete { winner, .. }) = events.last().map(|e| &e.payload) else {
        panic!("job did not complete: {:?}", events.last());
    };
    assert_eq!(winner.candidate_id, 1);

    let failed_completes = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::CandidateComplete {
                candidate_id,
                failed: true,
                ..
            } => Some(*candidate_id),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(failed_completes, vec![0]);

    let beam = orchestrator.beam(job_id, 0).unwrap();
    assert_eq!(beam.len(), 2);
    assert_eq!(beam[0].candidate_id, 1);
    assert_eq!(beam[0].rank, Some(1));
    let placeholder = &beam[1];
    assert!(placeholder.failed);
    assert_eq!(placeholder.rank, Some(2));
    assert_eq!(placeholder.reason.as_deref(), Some("generation failed"));
}

#[tokio::test]
async fn test_all_leaves_failed_is_fatal() {
    let language = MockLanguage::new();
    let image = MockImage::new();
    let vision = MockVision::new();
    image.fail_next(u32::MAX);
    let config = OrchestratorConfig {
        retries: CapabilityRetries {
            image: RetryPolicy::None,
            ..CapabilityRetries::default()
        },
        ..OrchestratorConfig::default()
    };
    let orchestrator = orchestrator_with(&language, &image, &vision, config);

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(2)
                .with_seed(7),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;

    let Some(EventPayload::Error { kind, .. }) = events.last().map(|e| &e.payload) else {
        panic!("job did not error: {:?}", events.last());
    };
    assert_eq!(kind, "all-leaves-failed");
    assert_eq!(orchestrator.job(job_id).unwrap().state, JobState::Error);
    // A fatal iteration emits no iteration-complete.
    assert_eq!(
        count_matching(&events, |p| matches!(
            p,
            EventPayload::IterationComplete { .. }
        )),
        0
    );
}

#[tokio::test]
async fn test_content_policy_rewrite_recovers_the_leaf() {
    // The combine step injects "neon", which the image provider rejects;
    // the rewrite path runs the flagged prompt back through refinement,
    // which strips the word, so every leaf recovers.
    let language = MockLanguage::new()
        .with_refine_handler(|text, dim| Ok(format!("{} [{dim}]", text.replace("neon", "soft"))))
        .with_combine_handler(|what, how, d| Ok(format!("{what}, {how}, neon glow (d{d})")));
    let image = MockImage::new().with_policy_trigger("neon");
    let vision = MockVision::new();
    let orchestrator =
        orchestrator_with(&language, &image, &vision, OrchestratorConfig::default());

    let job_id = orchestrator
        .start_job(
            JobParams::new("an alley at midnight")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(1)
                .with_seed(7),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;

    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(EventPayload::Complete { .. })
    ));
    let snapshot = orchestrator.job(job_id).unwrap();
    assert!(snapshot.candidates.iter().all(|c| !c.failed));

    // Each leaf: one rejected render plus one clean render.
    assert_eq!(image.generate_calls(), 4);
    // Four expansion refinements plus one rewrite per leaf.
    assert_eq!(language.refine_calls(), 6);
}

#[tokio::test]
async fn test_exhausted_policy_budget_fails_the_leaf() {
    // The default refine suffixes keep the trigger word, so rewriting never
    // helps and the budget runs out.
    let language = MockLanguage::new();
    let image = MockImage::new().with_policy_trigger("fox");
    let vision = MockVision::new();
    let orchestrator =
        orchestrator_with(&language, &image, &vision, OrchestratorConfig::default());

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(1)
                .with_seed(7),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;

    let Some(EventPayload::Error { kind, .. }) = events.last().map(|e| &e.payload) else {
        panic!("expected all leaves to fail: {:?}", events.last());
    };
    assert_eq!(kind, "all-leaves-failed");
}

#[tokio::test]
async fn test_native_batch_paths_are_used_when_supported() {
    let language = MockLanguage::new().with_batch_refine();
    let image = MockImage::new().with_batch();
    let vision = MockVision::new();
    let orchestrator =
        orchestrator_with(&language, &image, &vision, OrchestratorConfig::default());

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(3)
                .with_keep_top(1)
                .with_max_iterations(1)
                .with_seed(7),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;
    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(EventPayload::Complete { .. })
    ));

    // One native batch per expansion dimension, one image batch, no
    // per-leaf image calls.
    assert_eq!(language.batch_calls(), 2);
    assert_eq!(image.batch_calls(), 1);
    assert_eq!(image.generate_calls(), 0);
}

#[tokio::test]
async fn test_critique_and_negative_prompt_extensions() {
    let language = MockLanguage::new().with_critique().with_negative_prompt();
    let image = MockImage::new();
    let vision = MockVision::new();
    let orchestrator =
        orchestrator_with(&language, &image, &vision, OrchestratorConfig::default());

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(2)
                .with_seed(7)
                .with_modal(ModalOptions {
                    negative_prompt: true,
                    face_fix: true,
                    ..ModalOptions::default()
                }),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;
    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(EventPayload::Complete { .. })
    ));

    // One critique for the single kept parent entering iteration 1, and
    // one negative prompt per rendered leaf.
    assert_eq!(language.critique_calls(), 1);
    assert_eq!(language.negative_calls(), 4);
}

#[tokio::test]
async fn test_scoring_degrades_gracefully() {
    let language = MockLanguage::new();
    let image = MockImage::new();
    // Scoring is declared but always fails; ranking still works.
    let vision = MockVision::new().with_analyze_handler(|_, _| {
        Err(beamgen::error::Error::capability("vision", "scorer offline"))
    });
    let config = OrchestratorConfig {
        retries: CapabilityRetries {
            vision: RetryPolicy::None,
            ..CapabilityRetries::default()
        },
        ..OrchestratorConfig::default()
    };
    let orchestrator = orchestrator_with(&language, &image, &vision, config);

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(1)
                .with_seed(7),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;

    let Some(EventPayload::Complete { winner, .. }) = events.last().map(|e| &e.payload) else {
        panic!("job did not complete: {:?}", events.last());
    };
    // total_score is omitted when scoring fails.
    assert_eq!(winner.score, None);
    let snapshot = orchestrator.job(job_id).unwrap();
    assert!(snapshot.candidates.iter().all(|c| c.total_score.is_none()));
    assert!(snapshot.candidates.iter().all(|c| c.rank.is_some()));
}

#[tokio::test]
async fn test_late_subscriber_replays_full_run() {
    let language = MockLanguage::new();
    let image = MockImage::new();
    let vision = MockVision::new();
    let orchestrator =
        orchestrator_with(&language, &image, &vision, OrchestratorConfig::default());

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(2)
                .with_keep_top(1)
                .with_max_iterations(1)
                .with_seed(7),
        )
        .unwrap();
    // Drive the job to completion through a first subscriber.
    let live = collect_events(&orchestrator, job_id).await;

    // A subscriber joining after the fact replays the identical history.
    let replayed = orchestrator.subscribe(job_id).replay;
    assert_eq!(replayed.len(), live.len());
    assert!(matches!(
        replayed.first().map(|e| &e.payload),
        Some(EventPayload::Started { .. })
    ));
    assert!(replayed.last().unwrap().payload.is_terminal());
    for (a, b) in live.iter().zip(&replayed) {
        assert_eq!(a.payload, b.payload);
    }
}

#[tokio::test]
async fn test_remote_localities_raise_default_limits() {
    // A remote image provider gets the remote default concurrency; verify
    // jobs still run and the limiter can be retuned live.
    let language = MockLanguage::new();
    let image = MockImage::new().with_locality(Locality::Remote);
    let vision = MockVision::new();
    let orchestrator =
        orchestrator_with(&language, &image, &vision, OrchestratorConfig::default());
    orchestrator
        .tune_limiter(beamgen::capability::CapabilityKind::Image, 2)
        .unwrap();

    let job_id = orchestrator
        .start_job(
            JobParams::new("a red fox in the snow")
                .with_beam_width(4)
                .with_keep_top(2)
                .with_max_iterations(1)
                .with_seed(7),
        )
        .unwrap();
    let events = collect_events(&orchestrator, job_id).await;
    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(EventPayload::Complete { .. })
    ));
    assert_eq!(image.generate_calls(), 4);
}
