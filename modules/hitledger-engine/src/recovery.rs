//! Consolidate-then-retry recovery for batches blocked by duplicate resources.

use hitledger_common::Batch;
use hitledger_store::CanonicalStore;
use tracing::info;

use crate::consolidator::{ConsolidationReport, Consolidator};
use crate::error::BatchPartialFailure;
use crate::ingestor::{BatchIngestor, BatchReport};

#[derive(Debug)]
pub enum RecoveryOutcome {
    /// The first attempt succeeded.
    Clean(BatchReport),
    /// The first attempt hit ambiguous resources; consolidation and one retry
    /// cleared every failure.
    Recovered {
        first_attempt: BatchPartialFailure,
        consolidation: ConsolidationReport,
        retry: BatchReport,
    },
}

impl RecoveryOutcome {
    /// Hits written across every attempt.
    pub fn total_persisted(&self) -> usize {
        match self {
            RecoveryOutcome::Clean(report) => report.persisted,
            RecoveryOutcome::Recovered {
                first_attempt,
                retry,
                ..
            } => first_attempt.persisted + retry.persisted,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Failures that consolidation cannot fix; no retry was attempted.
    #[error("Batch failed without ambiguous resources: {0}")]
    NotRecoverable(BatchPartialFailure),

    #[error("Batch still failing after consolidation: {failure}")]
    RetryFailed {
        first_attempt: BatchPartialFailure,
        consolidation: ConsolidationReport,
        failure: BatchPartialFailure,
    },
}

/// Save `batch`; if any row was blocked by an ambiguous resource, merge the
/// affected groups and re-submit the same batch once.
pub async fn ingest_with_recovery<S: CanonicalStore>(
    ingestor: &BatchIngestor<S>,
    consolidator: &Consolidator<S>,
    batch: &Batch,
) -> Result<RecoveryOutcome, RecoveryError> {
    let first_attempt = match ingestor.save_batch(batch).await {
        Ok(report) => return Ok(RecoveryOutcome::Clean(report)),
        Err(failure) if failure.has_ambiguous_resources() => failure,
        Err(failure) => return Err(RecoveryError::NotRecoverable(failure)),
    };

    let keys = first_attempt.ambiguous_logical_keys();
    info!(
        ambiguous_keys = keys.len(),
        failed_rows = first_attempt.failures.len(),
        "Consolidating before retrying batch"
    );
    let consolidation = consolidator.consolidate_keys(&keys).await;

    match ingestor.save_batch(batch).await {
        Ok(retry) => Ok(RecoveryOutcome::Recovered {
            first_attempt,
            consolidation,
            retry,
        }),
        Err(failure) => Err(RecoveryError::RetryFailed {
            first_attempt,
            consolidation,
            failure,
        }),
    }
}
