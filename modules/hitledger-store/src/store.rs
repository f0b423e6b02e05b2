//! The canonical store contract.
//!
//! Every mutation happens inside a [`UnitOfWork`], which is a single transaction.
//! The ingestor opens one unit per hit; the consolidator opens one unit per
//! duplicate group. A unit that is dropped without `commit` rolls back.

use async_trait::async_trait;
use hitledger_common::{DependentKind, DependentRecord, NewHit, Resource};

use crate::error::Result;

/// Outcome of inserting a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitInsert {
    /// The hit was written with this surrogate id.
    Inserted(i64),
    /// A hit with the same request id already exists. Nothing was written.
    NaturalKeyConflict,
}

/// Entry point to a store. Cheap to clone; clones share the same backend.
#[async_trait]
pub trait CanonicalStore: Clone + Send + Sync + 'static {
    type Unit: UnitOfWork;

    /// Open a new transactional scope.
    async fn begin(&self) -> Result<Self::Unit>;

    /// Every logical key currently held by more than one resource row,
    /// ascending.
    async fn duplicate_logical_keys(&self) -> Result<Vec<String>>;

    async fn count_hits(&self) -> Result<i64>;

    async fn count_resources(&self) -> Result<i64>;
}

/// One transaction against the store.
#[async_trait]
pub trait UnitOfWork: Send + Sized {
    /// Resources sharing `url`, ordered by id. Zero, one or many.
    async fn find_resources_by_logical_key(&mut self, url: &str) -> Result<Vec<Resource>>;

    /// Same as [`find_resources_by_logical_key`](Self::find_resources_by_logical_key)
    /// but holds row locks until the unit ends, isolating a merge from concurrent
    /// writers touching the same rows.
    async fn lock_resources_by_logical_key(&mut self, url: &str) -> Result<Vec<Resource>>;

    async fn insert_resource(&mut self, url: &str) -> Result<Resource>;

    async fn insert_hit(&mut self, hit: &NewHit, resource_id: i64) -> Result<HitInsert>;

    async fn find_dependent_records(
        &mut self,
        kind: &DependentKind,
        resource_id: i64,
    ) -> Result<Vec<DependentRecord>>;

    async fn rewrite_resource_reference(
        &mut self,
        kind: &DependentKind,
        record_id: i64,
        new_resource_id: i64,
    ) -> Result<()>;

    /// Fails with `ResourceInUse` while anything still references `id`.
    async fn delete_resource(&mut self, id: i64) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// One-time schema invariants a store must hold before steady-state ingestion.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Delete every hit whose request id is shared with an earlier hit.
    /// Returns the number removed.
    async fn purge_duplicate_hits(&self) -> Result<u64>;

    /// Purge duplicates and make request id uniqueness enforced, atomically.
    /// Returns `(duplicates_removed, index_created)`.
    async fn enforce_unique_request_ids(&self) -> Result<(u64, bool)>;

    /// Create the non-unique lookup index over resource URLs if absent.
    async fn ensure_resource_lookup_index(&self) -> Result<bool>;
}
