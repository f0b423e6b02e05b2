//! One-time schema invariants, run before steady-state ingestion.
//!
//! Re-running is a no-op on a store that already satisfies them.

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::store::Bootstrap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub duplicate_hits_removed: u64,
    pub request_id_index_created: bool,
    pub resource_lookup_index_created: bool,
}

impl BootstrapReport {
    pub fn changed_anything(&self) -> bool {
        self.duplicate_hits_removed > 0
            || self.request_id_index_created
            || self.resource_lookup_index_created
    }
}

/// Purge duplicate hits, enforce request id uniqueness, and make sure logical
/// key lookups are indexed.
pub async fn run<B: Bootstrap + ?Sized>(store: &B) -> Result<BootstrapReport> {
    let (duplicate_hits_removed, request_id_index_created) =
        store.enforce_unique_request_ids().await?;
    let resource_lookup_index_created = store.ensure_resource_lookup_index().await?;

    let report = BootstrapReport {
        duplicate_hits_removed,
        request_id_index_created,
        resource_lookup_index_created,
    };

    if report.changed_anything() {
        info!(
            duplicate_hits_removed,
            request_id_index_created, resource_lookup_index_created, "Bootstrap applied"
        );
    } else {
        info!("Bootstrap: schema already up to date");
    }

    Ok(report)
}
