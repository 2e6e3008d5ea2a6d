// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Grouping of homogeneous language operations into batches.
//!
//! The orchestrator builds a flat list of prompt operations per phase; the
//! bundler groups them by kind (and dimension for expansions), splits each
//! group into batches of at most `max_batch_size`, and preserves operation
//! order within each group. Results flow back through a [`BundleResults`]
//! map addressable by operation id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::{LanguageResponse, PromptDimension};
use crate::error::{Error, Result};

/// Identifier of one operation within a bundle
pub type OperationId = u64;

/// Kind of a language operation, derived from its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Refine toward the content facet
    ExpandWhat,
    /// Refine toward the style facet
    ExpandHow,
    /// Merge a WHAT and HOW prompt
    Combine,
}

impl OperationKind {
    /// Dimension for expansion kinds; `None` for combine
    #[must_use]
    pub fn dimension(&self) -> Option<PromptDimension> {
        match self {
            OperationKind::ExpandWhat => Some(PromptDimension::What),
            OperationKind::ExpandHow => Some(PromptDimension::How),
            OperationKind::Combine => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::ExpandWhat => write!(f, "expand-what"),
            OperationKind::ExpandHow => write!(f, "expand-how"),
            OperationKind::Combine => write!(f, "combine"),
        }
    }
}

/// Payload of a language operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum OperationInput {
    /// Refine a prompt toward one dimension
    Expand {
        /// Facet to refine toward
        dimension: PromptDimension,
        /// Text to refine
        prompt: String,
    },
    /// Merge a WHAT and HOW prompt
    Combine {
        /// Content facet
        what: String,
        /// Style facet
        how: String,
        /// Verbosity level in 1..=3
        descriptiveness: u8,
    },
}

/// One language operation, identified within its bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptOperation {
    /// Id the caller uses to look up the result
    pub id: OperationId,
    /// Operation payload
    pub input: OperationInput,
}

impl PromptOperation {
    /// An expansion operation
    #[must_use]
    pub fn expand(id: OperationId, dimension: PromptDimension, prompt: impl Into<String>) -> Self {
        Self {
            id,
            input: OperationInput::Expand {
                dimension,
                prompt: prompt.into(),
            },
        }
    }

    /// A combine operation
    #[must_use]
    pub fn combine(
        id: OperationId,
        what: impl Into<String>,
        how: impl Into<String>,
        descriptiveness: u8,
    ) -> Self {
        Self {
            id,
            input: OperationInput::Combine {
                what: what.into(),
                how: how.into(),
                descriptiveness,
            },
        }
    }

    /// Kind this operation groups under
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match &self.input {
            OperationInput::Expand {
                dimension: PromptDimension::What,
                ..
            } => OperationKind::ExpandWhat,
            OperationInput::Expand {
                dimension: PromptDimension::How,
                ..
            } => OperationKind::ExpandHow,
            OperationInput::Combine { .. } => OperationKind::Combine,
        }
    }
}

/// A batch of operations of identical kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptBatch {
    /// Kind shared by every operation in the batch
    pub kind: OperationKind,
    /// Dimension shared by expansion batches
    pub dimension: Option<PromptDimension>,
    /// Operations in original submission order
    pub operations: Vec<PromptOperation>,
}

/// Accounting attached to a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Operations across all batches
    pub total_operations: usize,
    /// Number of batches produced
    pub total_batches: usize,
    /// When the bundle was assembled
    pub bundled_at: DateTime<Utc>,
}

/// The grouped form of a flat operation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptBundle {
    /// Batches in kind order (expand-what, expand-how, combine)
    pub batches: Vec<PromptBatch>,
    /// Bundle accounting
    pub metadata: BundleMetadata,
}

/// Groups flat operation lists into size-capped homogeneous batches
#[derive(Debug, Clone, Copy)]
pub struct PromptBundler {
    max_batch_size: usize,
}

impl PromptBundler {
    /// Create a bundler capping batches at `max_batch_size` operations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `max_batch_size` is zero.
    pub fn new(max_batch_size: usize) -> Result<Self> {
        if max_batch_size == 0 {
            return Err(Error::invalid_argument("max_batch_size must be >= 1"));
        }
        Ok(Self { max_batch_size })
    }

    /// Group `operations` by kind and split each group into batches.
    ///
    /// Operation order within each group follows submission order; groups
    /// are emitted in a fixed kind order for determinism.
    #[must_use]
    pub fn bundle(&self, operations: Vec<PromptOperation>) -> PromptBundle {
        let total_operations = operations.len();
        let mut groups: HashMap<OperationKind, Vec<PromptOperation>> = HashMap::new();
        for operation in operations {
            groups.entry(operation.kind()).or_default().push(operation);
        }

        let mut batches = Vec::new();
        for kind in [
            OperationKind::ExpandWhat,
            OperationKind::ExpandHow,
            OperationKind::Combine,
        ] {
            let Some(group) = groups.remove(&kind) else {
                continue;
            };
            let mut group = group.into_iter().peekable();
            while group.peek().is_some() {
                let chunk: Vec<PromptOperation> =
                    group.by_ref().take(self.max_batch_size).collect();
                batches.push(PromptBatch {
                    kind,
                    dimension: kind.dimension(),
                    operations: chunk,
                });
            }
        }

        PromptBundle {
            metadata: BundleMetadata {
                total_operations,
                total_batches: batches.len(),
                bundled_at: Utc::now(),
            },
            batches,
        }
    }
}

/// Per-operation results of a submitted bundle
#[derive(Debug, Clone, Default)]
pub struct BundleResults {
    results: HashMap<OperationId, LanguageResponse>,
}

impl BundleResults {
    /// Empty result map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result for `id`
    pub fn insert(&mut self, id: OperationId, response: LanguageResponse) {
        self.results.insert(id, response);
    }

    /// Result for `id`, if recorded
    #[must_use]
    pub fn get(&self, id: OperationId) -> Option<&LanguageResponse> {
        self.results.get(&id)
    }

    /// Number of recorded results
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no results have been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
