// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Total ordering of candidates from pairwise vision comparisons.
//!
//! Strategy is picked by candidate count:
//!
//! 1. `N <= all_at_once_threshold` (clamped to the vision capability's
//!    declared multi-image limit): one vision call ranks every image; the
//!    result is recorded as a clique of pairwise edges.
//! 2. `threshold < N <= all_pairs_max`: all-pairs tournament, `C(N,2)`
//!    ensemble comparisons, ordered by wins desc, average combined rank
//!    asc, candidate id asc.
//! 3. larger `N`: champion tournament that consults the comparison graph's
//!    transitive inference before every real comparison, cutting vision
//!    calls toward `O(N log N)` when strict-win chains exist.
//!
//! The ranker never mutates input candidates; it owns one fresh
//! [`ComparisonGraph`] per call and returns a new ordered list referencing
//! candidates by id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::candidate::CandidateId;
use crate::capability::{CapabilityKind, ImageRef, VisionCapability};
use crate::ensemble::EnsembleComparator;
use crate::error::{Error, Result};
use crate::graph::{AggregateStats, ComparisonGraph, Winner};
use crate::limiter::ConcurrencyLimiter;

/// Ranking strategy the ranker selected for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankStrategy {
    /// One multi-image vision call
    AllAtOnce,
    /// `C(N,2)` ensemble comparisons
    AllPairs,
    /// Champion tournament with transitive inference
    Tournament,
}

/// Tuning for a ranking call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankerOptions {
    /// Candidates to fully order before falling back to cumulative records
    pub keep_top: usize,
    /// Trials per ensemble comparison
    pub ensemble_size: usize,
    /// Largest N handed to a single multi-image vision call
    pub all_at_once_threshold: usize,
    /// Largest N ranked by the all-pairs tournament
    pub all_pairs_max: usize,
}

impl Default for RankerOptions {
    fn default() -> Self {
        Self {
            keep_top: 1,
            ensemble_size: 3,
            all_at_once_threshold: 4,
            all_pairs_max: 8,
        }
    }
}

impl RankerOptions {
    fn validate(&self) -> Result<()> {
        if self.keep_top == 0 {
            return Err(Error::invalid_argument("keep_top must be >= 1"));
        }
        if self.ensemble_size == 0 {
            return Err(Error::invalid_argument("ensemble_size must be >= 1"));
        }
        if self.all_at_once_threshold == 0 {
            return Err(Error::invalid_argument("all_at_once_threshold must be >= 1"));
        }
        if self.all_pairs_max < self.all_at_once_threshold {
            return Err(Error::invalid_argument(
                "all_pairs_max must be >= all_at_once_threshold",
            ));
        }
        Ok(())
    }
}

/// One candidate to rank
#[derive(Debug, Clone, PartialEq)]
pub struct RankEntry {
    /// Candidate id within the iteration
    pub id: CandidateId,
    /// The candidate's image
    pub image: ImageRef,
}

/// One position of the produced total order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    /// Candidate id within the iteration
    pub candidate_id: CandidateId,
    /// Position, 1 = best
    pub rank: u32,
    /// Why the candidate landed here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Strict wins across the call's comparisons
    pub wins: u32,
    /// Strict losses across the call's comparisons
    pub losses: u32,
    /// Aggregated rank averages, when score vectors were recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_scores: Option<AggregateStats>,
}

/// Result of one ranking call
#[derive(Debug, Clone, PartialEq)]
pub struct RankingOutcome {
    /// Total order, rank 1 first
    pub ordered: Vec<RankedCandidate>,
    /// Ensemble comparisons actually issued (inferred outcomes excluded)
    pub comparisons: u32,
    /// Strategy the call used
    pub strategy: RankStrategy,
}

/// Observed pairwise outcome, forwarded to the comparison hook as each real
/// comparison lands
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonEvent {
    /// First candidate
    pub id_a: CandidateId,
    /// Second candidate
    pub id_b: CandidateId,
    /// Outcome relative to `(id_a, id_b)`
    pub winner: Winner,
    /// Provider reasoning, when given
    pub reason: Option<String>,
}

/// Callback invoked for every real comparison, in the order outcomes are
/// recorded
pub type ComparisonHook = Arc<dyn Fn(ComparisonEvent) + Send + Sync>;

/// Comparative ranker over the vision capability
pub struct Ranker {
    vision: Arc<dyn VisionCapability>,
    limiter: ConcurrencyLimiter,
    options: RankerOptions,
    timeout: Duration,
    seed: u64,
    hook: Option<ComparisonHook>,
}

impl Ranker {
    /// Create a ranker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the options are out of range.
    pub fn new(
        vision: Arc<dyn VisionCapability>,
        limiter: ConcurrencyLimiter,
        options: RankerOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            vision,
            limiter,
            options,
            timeout: Duration::from_secs(60),
            seed: 0,
            hook: None,
        })
    }

    /// Seed for the ensemble's swap schedule
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Per-call timeout for vision comparisons
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Observe every real comparison as it is recorded
    #[must_use]
    pub fn with_comparison_hook(mut self, hook: ComparisonHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Produce a total order over `entries`.
    pub async fn rank(
        &self,
        entries: &[RankEntry],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RankingOutcome> {
        cancel.check()?;
        let n = entries.len();
        if n == 0 {
            return Ok(RankingOutcome {
                ordered: Vec::new(),
                comparisons: 0,
                strategy: RankStrategy::AllPairs,
            });
        }
        if n == 1 {
            return Ok(RankingOutcome {
                ordered: vec![RankedCandidate {
                    candidate_id: entries[0].id,
                    rank: 1,
                    reason: Some("sole candidate".to_string()),
                    wins: 0,
                    losses: 0,
                    avg_scores: None,
                }],
                comparisons: 0,
                strategy: RankStrategy::AllAtOnce,
            });
        }

        let threshold = self
            .options
            .all_at_once_threshold
            .min(self.vision.max_images_per_compare());
        if n <= threshold {
            match self.rank_all_at_once(entries, prompt, cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    warn!(
                        error = %err,
                        "all-at-once ranking failed, falling back to all-pairs"
                    );
                }
            }
        }
        if n <= self.options.all_pairs_max {
            self.rank_all_pairs(entries, prompt, cancel).await
        } else {
            self.rank_tournament(entries, prompt, cancel).await
        }
    }

    /// One multi-image vision call; outcome recorded as a clique.
    async fn rank_all_at_once(
        &self,
        entries: &[RankEntry],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RankingOutcome> {
        let images: Vec<ImageRef> = entries.iter().map(|e| e.image.clone()).collect();
        let ranking = self
            .limiter
            .execute(async {
                match tokio::time::timeout(
                    self.timeout,
                    self.vision.compare_images(&images, prompt, cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(
                        CapabilityKind::Vision.to_string(),
                        self.timeout.as_millis() as u64,
                    )),
                }
            })
            .await?;

        // index -> (rank, reason, per-factor ranks)
        let mut by_index: HashMap<usize, &crate::capability::RankedImage> = HashMap::new();
        for entry in &ranking.ranking {
            by_index.insert(entry.index, entry);
        }
        if (0..entries.len()).any(|i| !by_index.contains_key(&i)) {
            return Err(Error::capability(
                CapabilityKind::Vision.to_string(),
                format!(
                    "multi-image ranking returned {} entries for {} images",
                    by_index.len(),
                    entries.len()
                ),
            ));
        }

        let mut graph = ComparisonGraph::new();
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let (ri, rj) = (by_index[&i], by_index[&j]);
                let winner = match ri.rank.cmp(&rj.rank) {
                    std::cmp::Ordering::Less => Winner::A,
                    std::cmp::Ordering::Greater => Winner::B,
                    std::cmp::Ordering::Equal => Winner::Tie,
                };
                graph.record_comparison(
                    entries[i].id,
                    entries[j].id,
                    winner,
                    ri.ranks,
                    rj.ranks,
                )?;
                self.emit(ComparisonEvent {
                    id_a: entries[i].id,
                    id_b: entries[j].id,
                    winner,
                    reason: None,
                });
            }
        }

        // The capability's ranking is the oracle; duplicate ranks fall back
        // to candidate id for a stable order.
        let mut order: Vec<(u32, CandidateId, Option<String>)> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (by_index[&i].rank, e.id, by_index[&i].reason.clone()))
            .collect();
        order.sort_by_key(|(rank, id, _)| (*rank, *id));

        let ordered = order
            .into_iter()
            .enumerate()
            .map(|(position, (_, id, reason))| {
                self.ranked_candidate(&graph, id, position as u32 + 1, reason)
            })
            .collect();
        Ok(RankingOutcome {
            ordered,
            comparisons: 0,
            strategy: RankStrategy::AllAtOnce,
        })
    }

    /// `C(N,2)` ensemble comparisons, ordered by the clique's record.
    async fn rank_all_pairs(
        &self,
        entries: &[RankEntry],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RankingOutcome> {
        let ensemble = self.ensemble()?;
        let mut pairs = Vec::new();
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                pairs.push((i, j));
            }
        }

        let comparisons = futures::future::join_all(pairs.iter().map(|&(i, j)| {
            let ensemble = &ensemble;
            async move {
                let outcome = ensemble
                    .compare(
                        (entries[i].id, &entries[i].image),
                        (entries[j].id, &entries[j].image),
                        prompt,
                        cancel,
                    )
                    .await;
                (i, j, outcome)
            }
        }))
        .await;
        cancel.check()?;

        let mut graph = ComparisonGraph::new();
        let mut issued = 0u32;
        for (i, j, outcome) in comparisons {
            let outcome = outcome?;
            issued += 1;
            graph.record_comparison(
                entries[i].id,
                entries[j].id,
                outcome.winner,
                outcome.ranks_a,
                outcome.ranks_b,
            )?;
            self.emit(ComparisonEvent {
                id_a: entries[i].id,
                id_b: entries[j].id,
                winner: outcome.winner,
                reason: outcome.reason,
            });
        }

        let mut ids: Vec<CandidateId> = entries.iter().map(|e| e.id).collect();
        sort_by_record(&mut ids, &graph);

        let total = entries.len() - 1;
        let ordered = ids
            .into_iter()
            .enumerate()
            .map(|(position, id)| {
                let reason = self
                    .win_summary(&graph, id, total)
                    .unwrap_or_else(|| "no comparisons recorded".to_string());
                self.ranked_candidate(&graph, id, position as u32 + 1, Some(reason))
            })
            .collect();
        Ok(RankingOutcome {
            ordered,
            comparisons: issued,
            strategy: RankStrategy::AllPairs,
        })
    }

    /// Champion tournament: find the best remaining candidate by scanning
    /// challengers, consulting transitive inference before every real
    /// comparison.
    async fn rank_tournament(
        &self,
        entries: &[RankEntry],
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<RankingOutcome> {
        let ensemble = self.ensemble()?;
        let images: HashMap<CandidateId, &ImageRef> =
            entries.iter().map(|e| (e.id, &e.image)).collect();

        let mut remaining: Vec<CandidateId> = entries.iter().map(|e| e.id).collect();
        remaining.sort_unstable();

        let mut graph = ComparisonGraph::new();
        let mut issued = 0u32;
        let mut ordered: Vec<RankedCandidate> = Vec::with_capacity(entries.len());

        let target = self.options.keep_top.min(entries.len());
        while (ordered.len() < target) && remaining.len() > 1 {
            let mut champion = remaining[0];
            for &challenger in &remaining[1..] {
                cancel.check()?;
                let winner = match graph.can_infer_winner(champion, challenger) {
                    Some(inferred) => {
                        debug!(
                            champion,
                            challenger,
                            chain = ?inferred.chain,
                            "comparison inferred transitively"
                        );
                        inferred.winner
                    }
                    None => {
                        let outcome = ensemble
                            .compare(
                                (champion, images[&champion]),
                                (challenger, images[&challenger]),
                                prompt,
                                cancel,
                            )
                            .await?;
                        issued += 1;
                        graph.record_comparison(
                            champion,
                            challenger,
                            outcome.winner,
                            outcome.ranks_a,
                            outcome.ranks_b,
                        )?;
                        self.emit(ComparisonEvent {
                            id_a: champion,
                            id_b: challenger,
                            winner: outcome.winner,
                            reason: outcome.reason,
                        });
                        // A tie leaves the current champion standing.
                        match outcome.winner {
                            Winner::A | Winner::Tie => champion,
                            Winner::B => challenger,
                        }
                    }
                };
                if winner == challenger {
                    champion = challenger;
                }
            }
            let rank = ordered.len() as u32 + 1;
            let reason = self
                .win_summary(&graph, champion, remaining.len() - 1)
                .unwrap_or_else(|| "tournament champion".to_string());
            ordered.push(self.ranked_candidate(&graph, champion, rank, Some(reason)));
            remaining.retain(|&id| id != champion);
        }

        // Leftover positions by cumulative record; cycles resolve here
        // without further vision calls.
        sort_by_cumulative_record(&mut remaining, &graph);
        for id in remaining {
            let rank = ordered.len() as u32 + 1;
            ordered.push(self.ranked_candidate(
                &graph,
                id,
                rank,
                Some("ranked by cumulative record".to_string()),
            ));
        }

        Ok(RankingOutcome {
            ordered,
            comparisons: issued,
            strategy: RankStrategy::Tournament,
        })
    }

    fn ensemble(&self) -> Result<EnsembleComparator> {
        EnsembleComparator::new(
            Arc::clone(&self.vision),
            self.limiter.clone(),
            self.options.ensemble_size,
            self.timeout,
            self.seed,
        )
    }

    fn emit(&self, event: ComparisonEvent) {
        if let Some(hook) = &self.hook {
            hook(event);
        }
    }

    fn win_summary(
        &self,
        graph: &ComparisonGraph,
        id: CandidateId,
        opponents: usize,
    ) -> Option<String> {
        let stats = graph.aggregate_stats(id)?;
        Some(format!(
            "won {} of {} comparisons",
            stats.wins,
            opponents.max(stats.total_comparisons as usize)
        ))
    }

    fn ranked_candidate(
        &self,
        graph: &ComparisonGraph,
        id: CandidateId,
        rank: u32,
        reason: Option<String>,
    ) -> RankedCandidate {
        let stats = graph.aggregate_stats(id);
        RankedCandidate {
            candidate_id: id,
            rank,
            reason,
            wins: stats.as_ref().map_or(0, |s| s.wins),
            losses: stats.as_ref().map_or(0, |s| s.losses),
            avg_scores: stats,
        }
    }
}

/// Order ids by wins desc, then average combined rank asc (absent averages
/// last), then candidate id asc.
fn sort_by_record(ids: &mut [CandidateId], graph: &ComparisonGraph) {
    ids.sort_by(|&a, &b| {
        let stats_a = graph.aggregate_stats(a);
        let stats_b = graph.aggregate_stats(b);
        let wins_a = stats_a.as_ref().map_or(0, |s| s.wins);
        let wins_b = stats_b.as_ref().map_or(0, |s| s.wins);
        wins_b
            .cmp(&wins_a)
            .then_with(|| {
                let avg_a = stats_a.as_ref().and_then(|s| s.avg_combined);
                let avg_b = stats_b.as_ref().and_then(|s| s.avg_combined);
                match (avg_a, avg_b) {
                    (Some(x), Some(y)) => {
                        x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
            })
            .then_with(|| a.cmp(&b))
    });
}

/// Order ids by wins desc, then ties desc, then candidate id asc.
fn sort_by_cumulative_record(ids: &mut Vec<CandidateId>, graph: &ComparisonGraph) {
    ids.sort_by(|&a, &b| {
        let stats_a = graph.aggregate_stats(a);
        let stats_b = graph.aggregate_stats(b);
        let wins_a = stats_a.as_ref().map_or(0, |s| s.wins);
        let wins_b = stats_b.as_ref().map_or(0, |s| s.wins);
        let ties_a = stats_a.as_ref().map_or(0, |s| s.ties);
        let ties_b = stats_b.as_ref().map_or(0, |s| s.ties);
        wins_b
            .cmp(&wins_a)
            .then_with(|| ties_b.cmp(&ties_a))
            .then_with(|| a.cmp(&b))
    });
}
