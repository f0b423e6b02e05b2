//! Duplicate-safe hit ingestion and resource consolidation.
//!
//! [`BatchIngestor`] persists hits row by row, tolerating partial failure and
//! relying on the request id constraint for at-most-once storage under retry.
//! [`Consolidator`] merges resource rows that share a URL, repointing every
//! registered dependent kind before removing the duplicates.

pub mod consolidator;
pub mod error;
pub mod ingestor;
pub mod recovery;
pub mod rewrite;

pub use consolidator::{ConsolidationReport, Consolidator, GroupFailure, GroupOutcome, MergeSummary};
pub use error::{BatchPartialFailure, ConsolidationError, RowError, RowFailure};
pub use ingestor::{BatchIngestor, BatchReport, RowOutcome};
pub use recovery::{ingest_with_recovery, RecoveryError, RecoveryOutcome};
pub use rewrite::{rewrite_references, RewriteTally};
