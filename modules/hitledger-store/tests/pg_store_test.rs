//! Integration tests for PgStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.
//!
//! Tests share one database, so each works on its own unique URLs and request ids
//! instead of truncating tables.

use chrono::Utc;
use hitledger_common::{DependentKind, NewHit};
use hitledger_store::{
    bootstrap, Bootstrap, CanonicalStore, HitInsert, KindRegistry, PgStore, StoreError,
    UnitOfWork,
};
use uuid::Uuid;

/// Get a migrated, bootstrapped store, or skip if no test DB is available.
async fn test_store() -> Option<PgStore> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let store = PgStore::connect(&url, 5).await.ok()?;
    store.migrate().await.ok()?;
    bootstrap::run(&store).await.ok()?;
    Some(store)
}

fn unique_url() -> String {
    format!("http://whatever/{}", Uuid::new_v4())
}

async fn seed_resource(store: &PgStore, url: &str) -> i64 {
    let mut unit = store.begin().await.unwrap();
    let resource = unit.insert_resource(url).await.unwrap();
    unit.commit().await.unwrap();
    resource.id
}

// =========================================================================
// Resources
// =========================================================================

#[tokio::test]
async fn duplicate_urls_are_representable_and_ordered_by_id() {
    let Some(store) = test_store().await else {
        return;
    };
    let url = unique_url();
    let first = seed_resource(&store, &url).await;
    let second = seed_resource(&store, &url).await;

    let mut unit = store.begin().await.unwrap();
    let found = unit.find_resources_by_logical_key(&url).await.unwrap();
    unit.rollback().await.unwrap();

    assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first, second]);
    assert!(store.duplicate_logical_keys().await.unwrap().contains(&url));
}

#[tokio::test]
async fn rolled_back_unit_leaves_no_trace() {
    let Some(store) = test_store().await else {
        return;
    };
    let url = unique_url();

    let mut unit = store.begin().await.unwrap();
    unit.insert_resource(&url).await.unwrap();
    unit.rollback().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    assert!(unit.find_resources_by_logical_key(&url).await.unwrap().is_empty());
}

// =========================================================================
// Hits
// =========================================================================

#[tokio::test]
async fn second_insert_of_request_id_is_a_conflict() {
    let Some(store) = test_store().await else {
        return;
    };
    let resource_id = seed_resource(&store, &unique_url()).await;
    let hit = NewHit::new(Uuid::new_v4(), "ignored", Utc::now());

    let mut unit = store.begin().await.unwrap();
    let first = unit.insert_hit(&hit, resource_id).await.unwrap();
    unit.commit().await.unwrap();
    assert!(matches!(first, HitInsert::Inserted(_)));

    let mut unit = store.begin().await.unwrap();
    let second = unit.insert_hit(&hit, resource_id).await.unwrap();
    unit.rollback().await.unwrap();
    assert_eq!(second, HitInsert::NaturalKeyConflict);
}

// =========================================================================
// Dependent records
// =========================================================================

#[tokio::test]
async fn rewrite_moves_reference_and_unblocks_delete() {
    let Some(store) = test_store().await else {
        return;
    };
    let registry = KindRegistry::default();
    let likes: DependentKind = registry.get("page_likes").cloned().unwrap();
    let url = unique_url();
    let survivor = seed_resource(&store, &url).await;
    let loser = seed_resource(&store, &url).await;

    let like_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO page_likes (resource_id, username) VALUES ($1, 'bob') RETURNING id",
    )
    .bind(loser)
    .fetch_one(store.pool())
    .await
    .unwrap();

    // Delete is refused while the like points at the loser.
    let mut unit = store.begin().await.unwrap();
    let err = unit.delete_resource(loser).await.unwrap_err();
    assert!(matches!(err, StoreError::ResourceInUse { .. }));
    unit.rollback().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    let records = unit.find_dependent_records(&likes, loser).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, like_id);
    unit.rewrite_resource_reference(&likes, like_id, survivor)
        .await
        .unwrap();
    unit.delete_resource(loser).await.unwrap();
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    assert!(unit.find_dependent_records(&likes, loser).await.unwrap().is_empty());
    assert_eq!(unit.find_dependent_records(&likes, survivor).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rewrite_of_missing_record_is_rejected() {
    let Some(store) = test_store().await else {
        return;
    };
    let likes = KindRegistry::default().get("page_likes").cloned().unwrap();
    let survivor = seed_resource(&store, &unique_url()).await;

    let mut unit = store.begin().await.unwrap();
    let err = unit
        .rewrite_resource_reference(&likes, i64::MAX, survivor)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::RewriteRejected { .. }));
}

// =========================================================================
// Bootstrap
// =========================================================================

#[tokio::test]
async fn bootstrap_is_a_no_op_when_rerun() {
    let Some(store) = test_store().await else {
        return;
    };
    let report = bootstrap::run(&store).await.unwrap();
    assert!(!report.changed_anything());
    assert_eq!(store.purge_duplicate_hits().await.unwrap(), 0);
}
