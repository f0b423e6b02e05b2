//! Row-, group- and batch-level failures.
//!
//! Nothing here is fatal. Row failures never abort sibling rows, group failures
//! never abort sibling groups, and every failure is expected to clear after
//! consolidation followed by a retry.

use hitledger_store::StoreError;
use uuid::Uuid;

use crate::ingestor::RowOutcome;

/// Why a single hit could not be persisted.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("{} resources share logical key {logical_key}", .resource_ids.len())]
    AmbiguousResourceReference {
        logical_key: String,
        resource_ids: Vec<i64>,
    },

    /// Benign on retry: the hit is already stored.
    #[error("Hit {request_id} already exists")]
    NaturalKeyConflict { request_id: Uuid },

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RowError {
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, RowError::AmbiguousResourceReference { .. })
    }
}

/// Why one duplicate group could not be merged. The group is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum ConsolidationError {
    #[error("Failed to rewrite {kind} references to resource {survivor_id}: {source}")]
    ReferenceRewriteFailure {
        kind: String,
        record_id: Option<i64>,
        survivor_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("Failed to delete duplicate resource {resource_id}: {source}")]
    DeleteFailure {
        resource_id: i64,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A row that failed, with its position in the batch.
#[derive(Debug)]
pub struct RowFailure {
    pub index: usize,
    pub request_id: Uuid,
    pub url: String,
    pub cause: RowError,
}

/// Raised when any row of a batch failed.
///
/// Rows listed in `succeeded` are committed and stay committed. Re-submitting
/// the same batch is safe.
#[derive(Debug, thiserror::Error)]
#[error(
    "{} of {total} rows failed ({persisted} persisted, {skipped_existing} already present)",
    .failures.len()
)]
pub struct BatchPartialFailure {
    pub total: usize,
    pub persisted: usize,
    pub skipped_existing: usize,
    pub succeeded: Vec<RowOutcome>,
    pub failures: Vec<RowFailure>,
}

impl BatchPartialFailure {
    pub fn has_ambiguous_resources(&self) -> bool {
        self.failures.iter().any(|f| f.cause.is_ambiguous())
    }

    /// Distinct logical keys whose resolution was ambiguous, ascending.
    pub fn ambiguous_logical_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .failures
            .iter()
            .filter_map(|f| match &f.cause {
                RowError::AmbiguousResourceReference { logical_key, .. } => {
                    Some(logical_key.clone())
                }
                _ => None,
            })
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}
