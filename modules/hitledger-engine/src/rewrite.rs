//! Repoint dependent records from duplicate resources to a survivor.

use std::collections::BTreeMap;

use hitledger_store::{KindRegistry, UnitOfWork};
use tracing::debug;

use crate::error::ConsolidationError;

/// Records rewritten, per kind name.
pub type RewriteTally = BTreeMap<String, u64>;

/// Rewrite every record of every registered kind that references one of
/// `loser_ids` so it references `survivor_id` instead.
///
/// Runs inside the caller's unit of work. On error the caller must roll the
/// unit back; nothing here is committed on its own.
pub async fn rewrite_references<U: UnitOfWork>(
    unit: &mut U,
    registry: &KindRegistry,
    survivor_id: i64,
    loser_ids: &[i64],
) -> Result<RewriteTally, ConsolidationError> {
    let mut tally = RewriteTally::new();

    for kind in registry.kinds() {
        let mut rewritten = 0u64;

        for &loser_id in loser_ids {
            let records = unit
                .find_dependent_records(kind, loser_id)
                .await
                .map_err(|source| ConsolidationError::ReferenceRewriteFailure {
                    kind: kind.name.clone(),
                    record_id: None,
                    survivor_id,
                    source,
                })?;

            for record in records {
                unit.rewrite_resource_reference(kind, record.id, survivor_id)
                    .await
                    .map_err(|source| ConsolidationError::ReferenceRewriteFailure {
                        kind: kind.name.clone(),
                        record_id: Some(record.id),
                        survivor_id,
                        source,
                    })?;
                rewritten += 1;
            }
        }

        if rewritten > 0 {
            debug!(kind = %kind.name, rewritten, survivor_id, "Rewrote resource references");
            tally.insert(kind.name.clone(), rewritten);
        }
    }

    Ok(tally)
}
