//! Resource consolidation.
//!
//! Finds resource rows sharing a URL, keeps the one created first, repoints every
//! registered dependent kind at it, and deletes the rest. Each group is merged in
//! its own unit of work: either all of its references move and the duplicates
//! go, or nothing changes.

use std::collections::BTreeMap;

use hitledger_store::{CanonicalStore, KindRegistry, StoreError, UnitOfWork};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ConsolidationError;
use crate::rewrite::{rewrite_references, RewriteTally};

/// One merged group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub logical_key: String,
    pub survivor_id: i64,
    pub removed_ids: Vec<i64>,
    pub rewritten: RewriteTally,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Merged(MergeSummary),
    /// At most one row held the key by the time the group was locked.
    AlreadyConsolidated,
}

#[derive(Debug)]
pub struct GroupFailure {
    pub logical_key: String,
    pub cause: ConsolidationError,
}

#[derive(Debug, Default)]
pub struct ConsolidationReport {
    pub groups_found: usize,
    pub groups_merged: usize,
    pub groups_already_consolidated: usize,
    pub resources_removed: usize,
    pub references_rewritten: BTreeMap<String, u64>,
    pub merges: Vec<MergeSummary>,
    pub failures: Vec<GroupFailure>,
}

impl ConsolidationReport {
    /// True when every group found was merged or needed no merge.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, logical_key: &str, result: Result<GroupOutcome, ConsolidationError>) {
        match result {
            Ok(GroupOutcome::Merged(summary)) => {
                self.groups_merged += 1;
                self.resources_removed += summary.removed_ids.len();
                for (kind, n) in &summary.rewritten {
                    *self.references_rewritten.entry(kind.clone()).or_default() += n;
                }
                self.merges.push(summary);
            }
            Ok(GroupOutcome::AlreadyConsolidated) => self.groups_already_consolidated += 1,
            Err(cause) => self.failures.push(GroupFailure {
                logical_key: logical_key.to_string(),
                cause,
            }),
        }
    }
}

pub struct Consolidator<S: CanonicalStore> {
    store: S,
    registry: KindRegistry,
}

impl<S: CanonicalStore> Consolidator<S> {
    pub fn new(store: S, registry: KindRegistry) -> Self {
        Self { store, registry }
    }

    /// Merge every duplicate group in the store.
    ///
    /// Only listing the groups can fail the call; per-group failures are
    /// collected in the report and leave their group untouched.
    pub async fn consolidate(&self) -> Result<ConsolidationReport, StoreError> {
        let keys = self.store.duplicate_logical_keys().await?;
        Ok(self.consolidate_keys(&keys).await)
    }

    /// Merge the groups for the given logical keys, one at a time.
    pub async fn consolidate_keys(&self, keys: &[String]) -> ConsolidationReport {
        let mut report = ConsolidationReport {
            groups_found: keys.len(),
            ..ConsolidationReport::default()
        };

        for key in keys {
            let result = self.consolidate_key(key).await;
            if let Err(e) = &result {
                warn!(logical_key = %key, error = %e, "Failed to merge duplicate resources");
            }
            report.record(key, result);
        }

        info!(
            groups_found = report.groups_found,
            groups_merged = report.groups_merged,
            already_consolidated = report.groups_already_consolidated,
            resources_removed = report.resources_removed,
            failed = report.failures.len(),
            "Consolidation finished"
        );

        report
    }

    /// Merge the resources sharing `logical_key` in a single unit of work.
    pub async fn consolidate_key(
        &self,
        logical_key: &str,
    ) -> Result<GroupOutcome, ConsolidationError> {
        let mut unit = self.store.begin().await?;

        match merge_group(&mut unit, &self.registry, logical_key).await {
            Ok(GroupOutcome::Merged(summary)) => {
                unit.commit().await?;
                info!(
                    logical_key,
                    survivor_id = summary.survivor_id,
                    removed = ?summary.removed_ids,
                    "Merged duplicate resources"
                );
                Ok(GroupOutcome::Merged(summary))
            }
            Ok(GroupOutcome::AlreadyConsolidated) => {
                unit.rollback().await?;
                Ok(GroupOutcome::AlreadyConsolidated)
            }
            Err(e) => {
                if let Err(rb) = unit.rollback().await {
                    warn!(logical_key, error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn merge_group<U: UnitOfWork>(
    unit: &mut U,
    registry: &KindRegistry,
    logical_key: &str,
) -> Result<GroupOutcome, ConsolidationError> {
    let mut group = unit.lock_resources_by_logical_key(logical_key).await?;
    if group.len() < 2 {
        return Ok(GroupOutcome::AlreadyConsolidated);
    }

    // Earliest created wins. Enrichment state plays no part.
    group.sort_by_key(|r| r.id);
    let survivor_id = group[0].id;
    let loser_ids: Vec<i64> = group[1..].iter().map(|r| r.id).collect();

    let rewritten = rewrite_references(unit, registry, survivor_id, &loser_ids).await?;

    for &resource_id in &loser_ids {
        unit.delete_resource(resource_id)
            .await
            .map_err(|source| ConsolidationError::DeleteFailure {
                resource_id,
                source,
            })?;
    }

    Ok(GroupOutcome::Merged(MergeSummary {
        logical_key: logical_key.to_string(),
        survivor_id,
        removed_ids: loser_ids,
        rewritten,
    }))
}
