// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Pairwise comparison graph with transitive winner inference.
//!
//! One graph exists per ranking call. Edges are stored once per unordered
//! pair (lookup by either orientation returns the record with labels
//! swapped) and strict wins feed a breadth-first chain search so the ranker
//! can skip vision calls whose outcome is already implied. Ties are
//! recorded but are never transitive and never count toward wins or losses.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidate::CandidateId;
use crate::capability::FactorRanks;
use crate::error::{Error, Result};

/// Outcome of one pairwise comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    /// The first-listed candidate won
    A,
    /// The second-listed candidate won
    B,
    /// No strict winner
    Tie,
}

/// One directed pairwise outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    /// First-listed candidate
    pub id_a: CandidateId,
    /// Second-listed candidate
    pub id_b: CandidateId,
    /// Outcome relative to the listing order
    pub winner: Winner,
    /// Per-factor ranks for the first candidate, when assigned
    pub ranks_a: Option<FactorRanks>,
    /// Per-factor ranks for the second candidate, when assigned
    pub ranks_b: Option<FactorRanks>,
    /// When the comparison was recorded
    pub recorded_at: DateTime<Utc>,
}

impl ComparisonRecord {
    /// Winning candidate id; `None` for a tie
    #[must_use]
    pub fn winner_id(&self) -> Option<CandidateId> {
        match self.winner {
            Winner::A => Some(self.id_a),
            Winner::B => Some(self.id_b),
            Winner::Tie => None,
        }
    }

    /// The same record viewed from the opposite orientation
    #[must_use]
    pub fn swapped(&self) -> ComparisonRecord {
        ComparisonRecord {
            id_a: self.id_b,
            id_b: self.id_a,
            winner: match self.winner {
                Winner::A => Winner::B,
                Winner::B => Winner::A,
                Winner::Tie => Winner::Tie,
            },
            ranks_a: self.ranks_b,
            ranks_b: self.ranks_a,
            recorded_at: self.recorded_at,
        }
    }
}

/// Winner derived from a chain of strict wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredWinner {
    /// Candidate at the head of the chain
    pub winner: CandidateId,
    /// Chain of strict wins from winner to loser, endpoints included
    pub chain: Vec<CandidateId>,
}

/// Aggregated view of one candidate's comparisons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Comparisons the candidate took part in
    pub total_comparisons: u32,
    /// Strict wins
    pub wins: u32,
    /// Strict losses
    pub losses: u32,
    /// Ties
    pub ties: u32,
    /// Mean alignment rank over recorded score vectors (lower is better)
    pub avg_alignment: Option<f64>,
    /// Mean aesthetics rank over recorded score vectors
    pub avg_aesthetics: Option<f64>,
    /// Mean combined rank over recorded score vectors
    pub avg_combined: Option<f64>,
}

#[derive(Debug, Default)]
struct CandidateEntry {
    wins: u32,
    losses: u32,
    ties: u32,
    // (peer, ranks) so an overwritten edge can retract its score vector
    scores: Vec<(CandidateId, FactorRanks)>,
}

/// In-memory pairwise comparison store, scoped to one ranking call
#[derive(Debug, Default)]
pub struct ComparisonGraph {
    edges: HashMap<(CandidateId, CandidateId), ComparisonRecord>,
    candidates: HashMap<CandidateId, CandidateEntry>,
}

fn pair_key(id_a: CandidateId, id_b: CandidateId) -> (CandidateId, CandidateId) {
    if id_a <= id_b {
        (id_a, id_b)
    } else {
        (id_b, id_a)
    }
}

impl ComparisonGraph {
    /// Empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored edges
    #[must_use]
    pub fn comparison_count(&self) -> usize {
        self.edges.len()
    }

    /// Candidates that have taken part in at least one comparison
    #[must_use]
    pub fn candidate_ids(&self) -> Vec<CandidateId> {
        let mut ids: Vec<CandidateId> = self.candidates.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Store a comparison outcome and update per-candidate counters.
    ///
    /// If the pair was already recorded, the new record is authoritative:
    /// the old record's contribution to counters and score logs is
    /// retracted first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a self-edge.
    pub fn record_comparison(
        &mut self,
        id_a: CandidateId,
        id_b: CandidateId,
        winner: Winner,
        ranks_a: Option<FactorRanks>,
        ranks_b: Option<FactorRanks>,
    ) -> Result<()> {
        if id_a == id_b {
            return Err(Error::invalid_argument(format!(
                "self-comparison for candidate {id_a}"
            )));
        }

        let key = pair_key(id_a, id_b);
        if let Some(old) = self.edges.remove(&key) {
            self.retract(&old);
        }

        let record = ComparisonRecord {
            id_a,
            id_b,
            winner,
            ranks_a,
            ranks_b,
            recorded_at: Utc::now(),
        };
        self.apply(&record);
        self.edges.insert(key, record);
        Ok(())
    }

    fn apply(&mut self, record: &ComparisonRecord) {
        let entry_a = self.candidates.entry(record.id_a).or_default();
        match record.winner {
            Winner::A => entry_a.wins += 1,
            Winner::B => entry_a.losses += 1,
            Winner::Tie => entry_a.ties += 1,
        }
        if let Some(ranks) = record.ranks_a {
            entry_a.scores.push((record.id_b, ranks));
        }

        let entry_b = self.candidates.entry(record.id_b).or_default();
        match record.winner {
            Winner::A => entry_b.losses += 1,
            Winner::B => entry_b.wins += 1,
            Winner::Tie => entry_b.ties += 1,
        }
        if let Some(ranks) = record.ranks_b {
            entry_b.scores.push((record.id_a, ranks));
        }
    }

    fn retract(&mut self, record: &ComparisonRecord) {
        if let Some(entry_a) = self.candidates.get_mut(&record.id_a) {
            match record.winner {
                Winner::A => entry_a.wins -= 1,
                Winner::B => entry_a.losses -= 1,
                Winner::Tie => entry_a.ties -= 1,
            }
            entry_a.scores.retain(|(peer, _)| *peer != record.id_b);
        }
        if let Some(entry_b) = self.candidates.get_mut(&record.id_b) {
            match record.winner {
                Winner::A => entry_b.losses -= 1,
                Winner::B => entry_b.wins -= 1,
                Winner::Tie => entry_b.ties -= 1,
            }
            entry_b.scores.retain(|(peer, _)| *peer != record.id_a);
        }
    }

    /// Stored outcome for a pair, oriented so `id_a` is first.
    ///
    /// Lookup works from either orientation.
    #[must_use]
    pub fn comparison(&self, id_a: CandidateId, id_b: CandidateId) -> Option<ComparisonRecord> {
        let record = self.edges.get(&pair_key(id_a, id_b))?;
        if record.id_a == id_a {
            Some(record.clone())
        } else {
            Some(record.swapped())
        }
    }

    /// Whether any outcome is stored for the pair
    #[must_use]
    pub fn has_comparison(&self, id_a: CandidateId, id_b: CandidateId) -> bool {
        self.edges.contains_key(&pair_key(id_a, id_b))
    }

    /// Infer a winner for an unobserved pair from chains of strict wins.
    ///
    /// Breadth-first over strict-win edges from each side; tie-mediated
    /// edges are not followed. If both directions find a chain, the shorter
    /// one wins; equal lengths break toward the lower-id source.
    #[must_use]
    pub fn can_infer_winner(
        &self,
        id_a: CandidateId,
        id_b: CandidateId,
    ) -> Option<InferredWinner> {
        if id_a == id_b {
            return None;
        }
        let beats = self.strict_win_adjacency();
        let forward = bfs_chain(&beats, id_a, id_b);
        let backward = bfs_chain(&beats, id_b, id_a);

        match (forward, backward) {
            (Some(chain), None) => Some(InferredWinner {
                winner: id_a,
                chain,
            }),
            (None, Some(chain)) => Some(InferredWinner {
                winner: id_b,
                chain,
            }),
            (Some(fwd), Some(bwd)) => {
                let pick_forward = match fwd.len().cmp(&bwd.len()) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    std::cmp::Ordering::Equal => id_a < id_b,
                };
                if pick_forward {
                    Some(InferredWinner {
                        winner: id_a,
                        chain: fwd,
                    })
                } else {
                    Some(InferredWinner {
                        winner: id_b,
                        chain: bwd,
                    })
                }
            }
            (None, None) => None,
        }
    }

    /// Aggregated counters and rank averages for a candidate; `None` for
    /// ids the graph has never seen
    #[must_use]
    pub fn aggregate_stats(&self, id: CandidateId) -> Option<AggregateStats> {
        let entry = self.candidates.get(&id)?;
        let mean = |select: fn(&FactorRanks) -> Option<u32>| -> Option<f64> {
            let values: Vec<u32> = entry
                .scores
                .iter()
                .filter_map(|(_, ranks)| select(ranks))
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(f64::from(values.iter().sum::<u32>()) / values.len() as f64)
            }
        };
        Some(AggregateStats {
            total_comparisons: entry.wins + entry.losses + entry.ties,
            wins: entry.wins,
            losses: entry.losses,
            ties: entry.ties,
            avg_alignment: mean(|r| r.alignment),
            avg_aesthetics: mean(|r| r.aesthetics),
            avg_combined: mean(|r| r.combined),
        })
    }

    fn strict_win_adjacency(&self) -> HashMap<CandidateId, Vec<CandidateId>> {
        let mut beats: HashMap<CandidateId, Vec<CandidateId>> = HashMap::new();
        let mut keys: Vec<&(CandidateId, CandidateId)> = self.edges.keys().collect();
        // Deterministic neighbor order regardless of insertion history
        keys.sort_unstable();
        for key in keys {
            let record = &self.edges[key];
            if let Some(winner) = record.winner_id() {
                let loser = if winner == record.id_a {
                    record.id_b
                } else {
                    record.id_a
                };
                beats.entry(winner).or_default().push(loser);
            }
        }
        beats
    }
}

fn bfs_chain(
    beats: &HashMap<CandidateId, Vec<CandidateId>>,
    start: CandidateId,
    goal: CandidateId,
) -> Option<Vec<CandidateId>> {
    let mut visited: HashSet<CandidateId> = HashSet::from([start]);
    let mut parent: HashMap<CandidateId, CandidateId> = HashMap::new();
    let mut queue: VecDeque<CandidateId> = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        if node == goal {
            let mut chain = vec![goal];
            let mut cursor = goal;
            while let Some(&prev) = parent.get(&cursor) {
                chain.push(prev);
                cursor = prev;
            }
            chain.reverse();
            return Some(chain);
        }
        if let Some(losers) = beats.get(&node) {
            for &loser in losers {
                if visited.insert(loser) {
                    parent.insert(loser, node);
                    queue.push_back(loser);
                }
            }
        }
    }
    None
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(combined: u32) -> FactorRanks {
        FactorRanks {
            alignment: Some(combined),
            aesthetics: Some(combined),
            combined: Some(combined),
        }
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut graph = ComparisonGraph::new();
        assert!(matches!(
            graph.record_comparison(3, 3, Winner::A, None, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_symmetric_lookup_swaps_labels() {
        let mut graph = ComparisonGraph::new();
        graph
            .record_comparison(1, 2, Winner::A, Some(ranks(1)), Some(ranks(2)))
            .unwrap();

        let forward = graph.comparison(1, 2).unwrap();
        assert_eq!(forward.winner, Winner::A);
        assert_eq!(forward.winner_id(), Some(1));

        let backward = graph.comparison(2, 1).unwrap();
        assert_eq!(backward.id_a, 2);
        assert_eq!(backward.winner, Winner::B);
        assert_eq!(backward.winner_id(), Some(1));
        assert_eq!(backward.ranks_a, Some(ranks(2)));
    }

    #[test]
    fn test_counters_match_edges() {
        let mut graph = ComparisonGraph::new();
        graph.record_comparison(0, 1, Winner::A, None, None).unwrap();
        graph.record_comparison(0, 2, Winner::B, None, None).unwrap();
        graph.record_comparison(0, 3, Winner::Tie, None, None).unwrap();

        let stats = graph.aggregate_stats(0).unwrap();
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.ties, 1);
        assert_eq!(
            stats.total_comparisons,
            stats.wins + stats.losses + stats.ties
        );
        assert!(graph.aggregate_stats(99).is_none());
    }

    #[test]
    fn test_ties_do_not_touch_win_loss() {
        let mut graph = ComparisonGraph::new();
        graph.record_comparison(4, 5, Winner::Tie, None, None).unwrap();
        let stats = graph.aggregate_stats(4).unwrap();
        assert_eq!(stats.wins, 0);
        assert_eq!(stats.losses, 0);
        assert_eq!(stats.ties, 1);
    }

    #[test]
    fn test_transitive_inference_over_strict_wins() {
        let mut graph = ComparisonGraph::new();
        graph.record_comparison(0, 1, Winner::A, None, None).unwrap();
        graph.record_comparison(1, 2, Winner::A, None, None).unwrap();

        let inferred = graph.can_infer_winner(0, 2).unwrap();
        assert_eq!(inferred.winner, 0);
        assert_eq!(inferred.chain, vec![0, 1, 2]);
    }

    #[test]
    fn test_ties_are_not_transitive() {
        let mut graph = ComparisonGraph::new();
        graph.record_comparison(0, 1, Winner::A, None, None).unwrap();
        graph.record_comparison(1, 2, Winner::Tie, None, None).unwrap();
        assert!(graph.can_infer_winner(0, 2).is_none());
    }

    #[test]
    fn test_inference_with_conflicting_edge_uses_shortest_chain() {
        // A->B, B->C, C->D, then the conflicting D->B. BFS from A still
        // reaches D; BFS from D never reaches A.
        let mut graph = ComparisonGraph::new();
        let (a, b, c, d) = (0, 1, 2, 3);
        graph.record_comparison(a, b, Winner::A, None, None).unwrap();
        graph.record_comparison(b, c, Winner::A, None, None).unwrap();
        graph.record_comparison(c, d, Winner::A, None, None).unwrap();
        graph.record_comparison(d, b, Winner::A, None, None).unwrap();

        let inferred = graph.can_infer_winner(a, d).unwrap();
        assert_eq!(inferred.winner, a);
        assert_eq!(inferred.chain, vec![a, b, c, d]);
    }

    #[test]
    fn test_direct_edge_counts_as_inference() {
        let mut graph = ComparisonGraph::new();
        graph.record_comparison(7, 8, Winner::B, None, None).unwrap();
        let inferred = graph.can_infer_winner(7, 8).unwrap();
        assert_eq!(inferred.winner, 8);
        assert_eq!(inferred.chain, vec![8, 7]);
    }

    #[test]
    fn test_latest_record_is_authoritative() {
        let mut graph = ComparisonGraph::new();
        graph
            .record_comparison(1, 2, Winner::A, Some(ranks(1)), Some(ranks(2)))
            .unwrap();
        graph
            .record_comparison(2, 1, Winner::A, Some(ranks(1)), Some(ranks(2)))
            .unwrap();

        assert_eq!(graph.comparison_count(), 1);
        let record = graph.comparison(1, 2).unwrap();
        assert_eq!(record.winner_id(), Some(2));

        // Counters reflect only the surviving record.
        let stats_1 = graph.aggregate_stats(1).unwrap();
        assert_eq!(stats_1.wins, 0);
        assert_eq!(stats_1.losses, 1);
        assert_eq!(stats_1.total_comparisons, 1);
    }

    #[test]
    fn test_aggregate_rank_averages() {
        let mut graph = ComparisonGraph::new();
        graph
            .record_comparison(0, 1, Winner::A, Some(ranks(1)), Some(ranks(2)))
            .unwrap();
        graph
            .record_comparison(0, 2, Winner::A, Some(ranks(3)), Some(ranks(4)))
            .unwrap();

        let stats = graph.aggregate_stats(0).unwrap();
        assert_eq!(stats.avg_combined, Some(2.0));
        assert_eq!(stats.avg_alignment, Some(2.0));

        // Candidate seen without score vectors has no averages.
        let mut bare = ComparisonGraph::new();
        bare.record_comparison(0, 1, Winner::A, None, None).unwrap();
        let stats = bare.aggregate_stats(0).unwrap();
        assert!(stats.avg_combined.is_none());
    }

    #[test]
    fn test_candidate_ids_sorted() {
        let mut graph = ComparisonGraph::new();
        graph.record_comparison(5, 2, Winner::Tie, None, None).unwrap();
        graph.record_comparison(9, 0, Winner::A, None, None).unwrap();
        assert_eq!(graph.candidate_ids(), vec![0, 2, 5, 9]);
    }
}
