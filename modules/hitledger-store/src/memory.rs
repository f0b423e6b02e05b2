//! In-memory canonical store for tests and dry runs. No database required.
//!
//! Mirrors the Postgres store's observable rules: resource URLs are not unique,
//! hit request ids are unique once the bootstrap index exists, and a resource
//! cannot be deleted while anything references it. A unit of work holds the
//! store lock for its lifetime and publishes its staged copy on commit.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hitledger_common::{DependentKind, DependentRecord, NewHit, Resource};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::registry::HITS_TABLE;
use crate::store::{Bootstrap, CanonicalStore, HitInsert, UnitOfWork};

/// A persisted hit as held by the memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHit {
    pub id: i64,
    pub request_id: Uuid,
    pub resource_id: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct State {
    next_id: i64,
    resources: BTreeMap<i64, Resource>,
    hits: BTreeMap<i64, MemoryHit>,
    /// table -> record id -> resource id
    dependents: BTreeMap<String, BTreeMap<i64, i64>>,
    unique_request_ids: bool,
    resource_lookup_index: bool,
    failing_kinds: HashSet<String>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Record ids and their resource ids for one table. Hits live in their own map.
    fn references(&self, table: &str) -> Vec<(i64, i64)> {
        if table == HITS_TABLE {
            return self.hits.values().map(|h| (h.id, h.resource_id)).collect();
        }
        self.dependents
            .get(table)
            .map(|rows| rows.iter().map(|(id, rid)| (*id, *rid)).collect())
            .unwrap_or_default()
    }

    fn first_reference_to(&self, resource_id: i64) -> Option<String> {
        if self.hits.values().any(|h| h.resource_id == resource_id) {
            return Some(HITS_TABLE.to_string());
        }
        self.dependents
            .iter()
            .find(|(_, rows)| rows.values().any(|rid| *rid == resource_id))
            .map(|(table, _)| table.clone())
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// A store on which bootstrap has already run: request ids are unique.
    pub fn new() -> Self {
        Self::with_state(State {
            unique_request_ids: true,
            ..State::default()
        })
    }

    /// A store that has never been bootstrapped. Hit inserts fail until
    /// the request id index exists, just as they do in Postgres.
    pub fn legacy() -> Self {
        Self::with_state(State::default())
    }

    fn with_state(state: State) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    // -- Seeding (bypasses the unit-of-work path) ---------------------------

    /// Insert a resource row unconditionally, even if `url` already exists.
    pub async fn seed_resource(
        &self,
        url: &str,
        metadata_refreshed_at: Option<DateTime<Utc>>,
    ) -> Resource {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let resource = Resource {
            id,
            url: url.to_string(),
            metadata_refreshed_at,
        };
        state.resources.insert(id, resource.clone());
        resource
    }

    /// Insert a dependent record of `kind` pointing at `resource_id`.
    pub async fn seed_dependent(&self, kind: &DependentKind, resource_id: i64) -> Result<i64> {
        let mut state = self.state.lock().await;
        if !state.resources.contains_key(&resource_id) {
            return Err(StoreError::ResourceNotFound(resource_id));
        }
        let id = state.next_id();
        state
            .dependents
            .entry(kind.table.clone())
            .or_default()
            .insert(id, resource_id);
        Ok(id)
    }

    /// Insert a hit without checking request id uniqueness, modelling rows
    /// written before the unique index existed.
    pub async fn seed_raw_hit(&self, request_id: Uuid, resource_id: i64) -> i64 {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.hits.insert(
            id,
            MemoryHit {
                id,
                request_id,
                resource_id,
                occurred_at: Utc::now(),
            },
        );
        id
    }

    /// Make every rewrite of `kind` fail from now on.
    pub async fn fail_rewrites_for(&self, kind: &str) {
        self.state.lock().await.failing_kinds.insert(kind.to_string());
    }

    // -- Inspection ---------------------------------------------------------

    pub async fn resources(&self) -> Vec<Resource> {
        self.state.lock().await.resources.values().cloned().collect()
    }

    pub async fn resource(&self, id: i64) -> Option<Resource> {
        self.state.lock().await.resources.get(&id).cloned()
    }

    pub async fn hits(&self) -> Vec<MemoryHit> {
        self.state.lock().await.hits.values().cloned().collect()
    }

    /// Resource id referenced by one dependent record, if the record exists.
    pub async fn dependent_reference(&self, kind: &DependentKind, record_id: i64) -> Option<i64> {
        self.state
            .lock()
            .await
            .references(&kind.table)
            .into_iter()
            .find(|(id, _)| *id == record_id)
            .map(|(_, rid)| rid)
    }

    pub async fn has_resource_lookup_index(&self) -> bool {
        self.state.lock().await.resource_lookup_index
    }

    pub async fn enforces_unique_request_ids(&self) -> bool {
        self.state.lock().await.unique_request_ids
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    type Unit = MemoryUnit;

    async fn begin(&self) -> Result<MemoryUnit> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryUnit { guard, staged })
    }

    async fn duplicate_logical_keys(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for resource in state.resources.values() {
            *counts.entry(resource.url.as_str()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(url, _)| url.to_string())
            .collect())
    }

    async fn count_hits(&self) -> Result<i64> {
        Ok(self.state.lock().await.hits.len() as i64)
    }

    async fn count_resources(&self) -> Result<i64> {
        Ok(self.state.lock().await.resources.len() as i64)
    }
}

// ---------------------------------------------------------------------------
// MemoryUnit
// ---------------------------------------------------------------------------

pub struct MemoryUnit {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

impl MemoryUnit {
    fn resources_for(&self, url: &str) -> Vec<Resource> {
        self.staged
            .resources
            .values()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn find_resources_by_logical_key(&mut self, url: &str) -> Result<Vec<Resource>> {
        Ok(self.resources_for(url))
    }

    async fn lock_resources_by_logical_key(&mut self, url: &str) -> Result<Vec<Resource>> {
        // The unit already holds the store lock.
        Ok(self.resources_for(url))
    }

    async fn insert_resource(&mut self, url: &str) -> Result<Resource> {
        let id = self.staged.next_id();
        let resource = Resource {
            id,
            url: url.to_string(),
            metadata_refreshed_at: None,
        };
        self.staged.resources.insert(id, resource.clone());
        Ok(resource)
    }

    async fn insert_hit(&mut self, hit: &NewHit, resource_id: i64) -> Result<HitInsert> {
        if !self.staged.unique_request_ids {
            return Err(StoreError::MissingHitIndex);
        }
        if !self.staged.resources.contains_key(&resource_id) {
            return Err(StoreError::ResourceNotFound(resource_id));
        }
        if self
            .staged
            .hits
            .values()
            .any(|h| h.request_id == hit.request_id)
        {
            return Ok(HitInsert::NaturalKeyConflict);
        }

        let id = self.staged.next_id();
        self.staged.hits.insert(
            id,
            MemoryHit {
                id,
                request_id: hit.request_id,
                resource_id,
                occurred_at: hit.occurred_at,
            },
        );
        Ok(HitInsert::Inserted(id))
    }

    async fn find_dependent_records(
        &mut self,
        kind: &DependentKind,
        resource_id: i64,
    ) -> Result<Vec<DependentRecord>> {
        Ok(self
            .staged
            .references(&kind.table)
            .into_iter()
            .filter(|(_, rid)| *rid == resource_id)
            .map(|(id, rid)| DependentRecord {
                kind: kind.name.clone(),
                id,
                resource_id: rid,
            })
            .collect())
    }

    async fn rewrite_resource_reference(
        &mut self,
        kind: &DependentKind,
        record_id: i64,
        new_resource_id: i64,
    ) -> Result<()> {
        let rejected = || StoreError::RewriteRejected {
            kind: kind.name.clone(),
            record_id,
        };
        if self.staged.failing_kinds.contains(&kind.name) {
            return Err(rejected());
        }
        if !self.staged.resources.contains_key(&new_resource_id) {
            return Err(StoreError::ResourceNotFound(new_resource_id));
        }

        if kind.table == HITS_TABLE {
            let hit = self.staged.hits.get_mut(&record_id).ok_or_else(rejected)?;
            hit.resource_id = new_resource_id;
        } else {
            let slot = self
                .staged
                .dependents
                .get_mut(&kind.table)
                .and_then(|rows| rows.get_mut(&record_id))
                .ok_or_else(rejected)?;
            *slot = new_resource_id;
        }
        Ok(())
    }

    async fn delete_resource(&mut self, id: i64) -> Result<()> {
        if let Some(kind) = self.staged.first_reference_to(id) {
            return Err(StoreError::ResourceInUse { id, kind });
        }
        self.staged
            .resources
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::ResourceNotFound(id))
    }

    async fn commit(mut self) -> Result<()> {
        *self.guard = self.staged;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

fn purge_duplicates(state: &mut State) -> u64 {
    let mut seen = HashSet::new();
    let doomed: Vec<i64> = state
        .hits
        .values()
        .filter(|h| !seen.insert(h.request_id))
        .map(|h| h.id)
        .collect();
    for id in &doomed {
        state.hits.remove(id);
    }
    doomed.len() as u64
}

#[async_trait]
impl Bootstrap for MemoryStore {
    async fn purge_duplicate_hits(&self) -> Result<u64> {
        Ok(purge_duplicates(&mut *self.state.lock().await))
    }

    async fn enforce_unique_request_ids(&self) -> Result<(u64, bool)> {
        let mut state = self.state.lock().await;
        if state.unique_request_ids {
            return Ok((0, false));
        }
        let removed = purge_duplicates(&mut state);
        state.unique_request_ids = true;
        Ok((removed, true))
    }

    async fn ensure_resource_lookup_index(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let created = !state.resource_lookup_index;
        state.resource_lookup_index = true;
        Ok(created)
    }
}
