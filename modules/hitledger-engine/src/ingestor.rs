//! Batch hit ingestion.
//!
//! Each row is its own unit of work: resolve the resource by URL, insert the hit,
//! commit. A failed row rolls back alone and the batch carries on. The batch as a
//! whole is not atomic.

use futures::stream::{self, StreamExt};
use hitledger_common::{Batch, Config, NewHit};
use hitledger_store::{CanonicalStore, HitInsert, UnitOfWork};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BatchPartialFailure, RowError, RowFailure};

/// What happened to a row that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RowOutcome {
    Persisted { index: usize, hit_id: i64 },
    /// The request id was already stored, by an earlier call or an earlier row.
    AlreadyPresent { index: usize, request_id: Uuid },
}

/// Result of a batch in which no row failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub persisted: usize,
    pub skipped_existing: usize,
    pub outcomes: Vec<RowOutcome>,
}

pub struct BatchIngestor<S: CanonicalStore> {
    store: S,
    row_concurrency: usize,
}

impl<S: CanonicalStore> BatchIngestor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            row_concurrency: 1,
        }
    }

    pub fn from_config(store: S, config: &Config) -> Self {
        Self::new(store).with_row_concurrency(config.ingest_row_concurrency)
    }

    /// How many rows may be in flight at once. Outcomes are still reported in
    /// batch order.
    pub fn with_row_concurrency(mut self, n: usize) -> Self {
        self.row_concurrency = n.max(1);
        self
    }

    /// Persist every row of `batch` independently.
    ///
    /// Fails with [`BatchPartialFailure`] if any row failed; rows that succeeded
    /// remain committed either way. Rows whose request id is already stored are
    /// skipped and do not count as failures.
    pub async fn save_batch(&self, batch: &Batch) -> Result<BatchReport, BatchPartialFailure> {
        let results: Vec<(usize, &NewHit, Result<i64, RowError>)> =
            stream::iter(batch.rows().iter().enumerate())
                .map(|(index, hit)| async move { (index, hit, self.save_row(hit).await) })
                .buffered(self.row_concurrency)
                .collect()
                .await;

        let mut outcomes = Vec::new();
        let mut failures = Vec::new();
        let mut persisted = 0;
        let mut skipped_existing = 0;

        for (index, hit, result) in results {
            match result {
                Ok(hit_id) => {
                    persisted += 1;
                    outcomes.push(RowOutcome::Persisted { index, hit_id });
                }
                Err(RowError::NaturalKeyConflict { request_id }) => {
                    debug!(index, %request_id, "Hit already present, skipping");
                    skipped_existing += 1;
                    outcomes.push(RowOutcome::AlreadyPresent { index, request_id });
                }
                Err(cause) => {
                    warn!(index, request_id = %hit.request_id, url = %hit.url, error = %cause, "Failed to save hit");
                    failures.push(RowFailure {
                        index,
                        request_id: hit.request_id,
                        url: hit.url.clone(),
                        cause,
                    });
                }
            }
        }

        info!(
            total = batch.len(),
            persisted,
            skipped_existing,
            failed = failures.len(),
            "Saved hit batch"
        );

        if failures.is_empty() {
            Ok(BatchReport {
                total: batch.len(),
                persisted,
                skipped_existing,
                outcomes,
            })
        } else {
            Err(BatchPartialFailure {
                total: batch.len(),
                persisted,
                skipped_existing,
                succeeded: outcomes,
                failures,
            })
        }
    }

    /// One row, one transaction.
    async fn save_row(&self, hit: &NewHit) -> Result<i64, RowError> {
        if let Some(reason) = hit.validation_error() {
            return Err(RowError::InvalidRow(reason));
        }

        let mut unit = self.store.begin().await?;
        match persist_hit(&mut unit, hit).await {
            Ok(hit_id) => {
                unit.commit().await?;
                debug!(request_id = %hit.request_id, hit_id, "Hit saved");
                Ok(hit_id)
            }
            Err(e) => {
                if let Err(rb) = unit.rollback().await {
                    warn!(request_id = %hit.request_id, error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn persist_hit<U: UnitOfWork>(unit: &mut U, hit: &NewHit) -> Result<i64, RowError> {
    let resource_id = resolve_resource(unit, &hit.url).await?;
    match unit.insert_hit(hit, resource_id).await? {
        HitInsert::Inserted(id) => Ok(id),
        HitInsert::NaturalKeyConflict => Err(RowError::NaturalKeyConflict {
            request_id: hit.request_id,
        }),
    }
}

/// Resolve a URL to exactly one resource id, creating the resource on first
/// sighting. More than one match is ambiguous until consolidation runs.
async fn resolve_resource<U: UnitOfWork>(unit: &mut U, url: &str) -> Result<i64, RowError> {
    let found = unit.find_resources_by_logical_key(url).await?;
    match found.as_slice() {
        [] => {
            let created = unit.insert_resource(url).await?;
            debug!(url, resource_id = created.id, "Created resource");
            Ok(created.id)
        }
        [only] => Ok(only.id),
        many => Err(RowError::AmbiguousResourceReference {
            logical_key: url.to_string(),
            resource_ids: many.iter().map(|r| r.id).collect(),
        }),
    }
}
