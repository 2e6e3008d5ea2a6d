// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Ensemble voting over pairwise vision comparisons.
//!
//! A pair (A, B) is judged by K independent vision calls running
//! concurrently through the vision limiter. Presentation order is swapped
//! per trial on a balanced, seeded schedule so neither candidate
//! systematically occupies the first slot, and the label the provider
//! returns is mapped back to the true candidate. Majority vote decides; a
//! plurality for "tie" or a missing strict majority is a tie.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::candidate::CandidateId;
use crate::capability::{CapabilityKind, FactorRanks, ImageRef, VisionCapability};
use crate::error::{Error, Result};
use crate::graph::Winner;
use crate::limiter::ConcurrencyLimiter;

/// Result of one ensemble vote over a pair
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleOutcome {
    /// Winner relative to the (a, b) argument order
    pub winner: Winner,
    /// Trials won by candidate a
    pub votes_a: u32,
    /// Trials won by candidate b
    pub votes_b: u32,
    /// Trials judged a tie
    pub votes_tie: u32,
    /// Set when too few trials produced outcomes for a confident vote
    pub degraded: bool,
    /// Representative reasoning from a successful trial
    pub reason: Option<String>,
    /// Per-factor ranks for a from a successful trial
    pub ranks_a: Option<FactorRanks>,
    /// Per-factor ranks for b from a successful trial
    pub ranks_b: Option<FactorRanks>,
}

#[derive(Debug)]
struct TrialOutcome {
    // 0 = first presented image, 1 = second; None = tie
    winner_slot: Option<usize>,
    reason: Option<String>,
    ranks: [Option<FactorRanks>; 2],
}

/// K-trial pairwise comparator over the vision capability
pub struct EnsembleComparator {
    vision: Arc<dyn VisionCapability>,
    limiter: ConcurrencyLimiter,
    size: usize,
    trial_timeout: Duration,
    rng: Mutex<StdRng>,
}

impl EnsembleComparator {
    /// Create a comparator running `size` trials per pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `size` is zero.
    pub fn new(
        vision: Arc<dyn VisionCapability>,
        limiter: ConcurrencyLimiter,
        size: usize,
        trial_timeout: Duration,
        seed: u64,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid_argument("ensemble size must be >= 1"));
        }
        Ok(Self {
            vision,
            limiter,
            size,
            trial_timeout,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Judge the pair with `size` concurrent trials and majority-vote the
    /// outcomes.
    pub async fn compare(
        &self,
        a: (CandidateId, &ImageRef),
        b: (CandidateId, &ImageRef),
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<EnsembleOutcome> {
        cancel.check()?;
        let schedule = {
            let mut rng = self.rng.lock();
            balanced_schedule(&mut rng, self.size)
        };

        let trials = schedule.iter().map(|&swapped| {
            let (first, second) = if swapped { (b.1, a.1) } else { (a.1, b.1) };
            async move {
                let attempt = self.run_trial(first, second, prompt, cancel).await;
                let outcome = match attempt {
                    Ok(outcome) => Ok(outcome),
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(err) => {
                        // One fresh slot per failed trial
                        debug!(error = %err, "ensemble trial failed, retrying once");
                        self.run_trial(first, second, prompt, cancel).await
                    }
                };
                (swapped, outcome)
            }
        });
        let results = futures::future::join_all(trials).await;
        cancel.check()?;

        let mut votes_a = 0u32;
        let mut votes_b = 0u32;
        let mut votes_tie = 0u32;
        let mut reason = None;
        let mut ranks_a = None;
        let mut ranks_b = None;
        let mut outcomes = 0u32;

        for (swapped, result) in results {
            let Ok(trial) = result else { continue };
            outcomes += 1;
            // Map the presented slot back to the true candidate.
            match trial.winner_slot {
                None => votes_tie += 1,
                Some(slot) => {
                    let a_won = (slot == 0) != swapped;
                    if a_won {
                        votes_a += 1;
                    } else {
                        votes_b += 1;
                    }
                }
            }
            if reason.is_none() {
                reason = trial.reason;
            }
            if ranks_a.is_none() {
                let (slot_a, slot_b) = if swapped { (1, 0) } else { (0, 1) };
                ranks_a = trial.ranks[slot_a];
                ranks_b = trial.ranks[slot_b];
            }
        }

        let majority = self.size as u32 / 2 + 1;
        if outcomes < majority {
            warn!(
                id_a = a.0,
                id_b = b.0,
                outcomes,
                required = majority,
                "ensemble degraded: too few trial outcomes, returning tie"
            );
            return Ok(EnsembleOutcome {
                winner: Winner::Tie,
                votes_a,
                votes_b,
                votes_tie,
                degraded: true,
                reason,
                ranks_a,
                ranks_b,
            });
        }

        let winner = if votes_tie >= votes_a && votes_tie >= votes_b {
            Winner::Tie
        } else if votes_a == votes_b {
            Winner::Tie
        } else if votes_a > votes_b && 2 * votes_a > outcomes {
            Winner::A
        } else if votes_b > votes_a && 2 * votes_b > outcomes {
            Winner::B
        } else {
            Winner::Tie
        };

        Ok(EnsembleOutcome {
            winner,
            votes_a,
            votes_b,
            votes_tie,
            degraded: false,
            reason,
            ranks_a,
            ranks_b,
        })
    }

    async fn run_trial(
        &self,
        first: &ImageRef,
        second: &ImageRef,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<TrialOutcome> {
        cancel.check()?;
        let images = [first.clone(), second.clone()];
        let ranking = self
            .limiter
            .execute(async {
                match tokio::time::timeout(
                    self.trial_timeout,
                    self.vision.compare_images(&images, prompt, cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(
                        CapabilityKind::Vision.to_string(),
                        self.trial_timeout.as_millis() as u64,
                    )),
                }
            })
            .await?;

        let mut slots: [Option<&crate::capability::RankedImage>; 2] = [None, None];
        for entry in &ranking.ranking {
            if entry.index < 2 {
                slots[entry.index] = Some(entry);
            }
        }
        let (Some(slot0), Some(slot1)) = (slots[0], slots[1]) else {
            return Err(Error::capability(
                CapabilityKind::Vision.to_string(),
                "comparison ranking missing an entry per image",
            ));
        };

        let winner_slot = match slot0.rank.cmp(&slot1.rank) {
            std::cmp::Ordering::Less => Some(0),
            std::cmp::Ordering::Greater => Some(1),
            std::cmp::Ordering::Equal => None,
        };
        let reason = match winner_slot {
            Some(0) | None => slot0.reason.clone().or_else(|| slot1.reason.clone()),
            _ => slot1.reason.clone().or_else(|| slot0.reason.clone()),
        };
        Ok(TrialOutcome {
            winner_slot,
            reason,
            ranks: [slot0.ranks, slot1.ranks],
        })
    }
}

/// Balanced presentation schedule: `⌊size/2⌋` swapped trials shuffled into
/// the rest, so each candidate takes the first slot in at least `⌊size/2⌋`
/// trials (for size ≥ 2).
pub(crate) fn balanced_schedule(rng: &mut StdRng, size: usize) -> Vec<bool> {
    let mut schedule: Vec<bool> = (0..size).map(|i| i < size / 2).collect();
    schedule.shuffle(rng);
    schedule
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityStatus, ComparisonRanking, RankedImage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Vision stub whose verdict is a pure function of the presented pair
    struct ScriptedVision {
        // Winner slot by locator comparison; lower locator wins
        calls: AtomicU32,
        fail_first: AtomicU32,
        tie: bool,
    }

    impl ScriptedVision {
        fn lower_wins() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(0),
                tie: false,
            }
        }

        fn always_tie() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(0),
                tie: true,
            }
        }

        fn failing_first(n: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: AtomicU32::new(n),
                tie: false,
            }
        }
    }

    #[async_trait]
    impl VisionCapability for ScriptedVision {
        async fn status(&self) -> Result<CapabilityStatus> {
            Ok(CapabilityStatus::ready())
        }

        async fn compare_images(
            &self,
            images: &[ImageRef],
            _prompt: &str,
            _cancel: &CancellationToken,
        ) -> Result<ComparisonRanking> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let consumed = self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
            if consumed.is_ok() {
                return Err(Error::capability("vision", "transient"));
            }
            let ranking = if self.tie {
                vec![
                    RankedImage {
                        index: 0,
                        rank: 1,
                        reason: None,
                        ranks: None,
                    },
                    RankedImage {
                        index: 1,
                        rank: 1,
                        reason: None,
                        ranks: None,
                    },
                ]
            } else {
                let zero_wins = images[0].locator < images[1].locator;
                vec![
                    RankedImage {
                        index: 0,
                        rank: if zero_wins { 1 } else { 2 },
                        reason: Some("sharper subject".into()),
                        ranks: None,
                    },
                    RankedImage {
                        index: 1,
                        rank: if zero_wins { 2 } else { 1 },
                        reason: None,
                        ranks: None,
                    },
                ]
            };
            Ok(ComparisonRanking { ranking })
        }
    }

    fn images() -> (ImageRef, ImageRef) {
        (ImageRef::new("blob://a"), ImageRef::new("blob://b"))
    }

    fn comparator(vision: Arc<dyn VisionCapability>, size: usize) -> EnsembleComparator {
        EnsembleComparator::new(
            vision,
            ConcurrencyLimiter::new(4).unwrap(),
            size,
            Duration::from_secs(5),
            42,
        )
        .unwrap()
    }

    #[test]
    fn test_zero_size_rejected() {
        let vision: Arc<dyn VisionCapability> = Arc::new(ScriptedVision::lower_wins());
        let result = EnsembleComparator::new(
            vision,
            ConcurrencyLimiter::new(1).unwrap(),
            0,
            Duration::from_secs(1),
            0,
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_balanced_schedule_swap_counts() {
        let mut rng = StdRng::seed_from_u64(7);
        for size in 2..=9usize {
            let schedule = balanced_schedule(&mut rng, size);
            let swapped = schedule.iter().filter(|&&s| s).count();
            assert_eq!(swapped, size / 2, "size {size}");
            assert_eq!(schedule.len(), size);
        }
    }

    #[test]
    fn test_schedule_is_seed_deterministic() {
        let a = balanced_schedule(&mut StdRng::seed_from_u64(9), 5);
        let b = balanced_schedule(&mut StdRng::seed_from_u64(9), 5);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_unanimous_winner_survives_swapping() {
        // "blob://a" beats "blob://b" in every presentation order, so the
        // vote must be unanimous for candidate a despite swapped trials.
        let vision = Arc::new(ScriptedVision::lower_wins());
        let comparator = comparator(vision.clone(), 5);
        let (img_a, img_b) = images();

        let outcome = comparator
            .compare((0, &img_a), (1, &img_b), "a red fox", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.winner, Winner::A);
        assert_eq!(outcome.votes_a, 5);
        assert_eq!(outcome.votes_b, 0);
        assert!(!outcome.degraded);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 5);
        assert_eq!(outcome.reason.as_deref(), Some("sharper subject"));
    }

    #[tokio::test]
    async fn test_tie_plurality_yields_tie() {
        let vision = Arc::new(ScriptedVision::always_tie());
        let comparator = comparator(vision, 3);
        let (img_a, img_b) = images();

        let outcome = comparator
            .compare((0, &img_a), (1, &img_b), "p", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.winner, Winner::Tie);
        assert_eq!(outcome.votes_tie, 3);
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn test_failed_trials_are_retried_once() {
        // Three trials through a width-1 limiter, so calls serialize FIFO:
        // the two injected failures land on the first two initial calls and
        // both retries succeed, bringing outcomes back to 3.
        let vision = Arc::new(ScriptedVision::failing_first(2));
        let comparator = EnsembleComparator::new(
            vision.clone(),
            ConcurrencyLimiter::new(1).unwrap(),
            3,
            Duration::from_secs(5),
            42,
        )
        .unwrap();
        let (img_a, img_b) = images();

        let outcome = comparator
            .compare((0, &img_a), (1, &img_b), "p", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.degraded);
        assert_eq!(outcome.votes_a + outcome.votes_b + outcome.votes_tie, 3);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_too_few_outcomes_degrades_to_tie() {
        // Every call fails (initial + retry per trial), so no outcomes.
        let vision = Arc::new(ScriptedVision::failing_first(u32::MAX));
        let comparator = comparator(vision, 3);
        let (img_a, img_b) = images();

        let outcome = comparator
            .compare((0, &img_a), (1, &img_b), "p", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.winner, Winner::Tie);
        assert!(outcome.degraded);
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let vision = Arc::new(ScriptedVision::lower_wins());
        let comparator = comparator(vision, 3);
        let (img_a, img_b) = images();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = comparator
            .compare((0, &img_a), (1, &img_b), "p", &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
