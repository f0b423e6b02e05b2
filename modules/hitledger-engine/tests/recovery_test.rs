//! Consolidate-then-retry: duplicate resources blocking a batch, repaired and
//! re-submitted, ending with every request id stored exactly once.

use chrono::Utc;
use hitledger_common::{Batch, HitAttributes, NewHit};
use hitledger_engine::{
    ingest_with_recovery, BatchIngestor, Consolidator, RecoveryError, RecoveryOutcome,
};
use hitledger_store::{bootstrap, CanonicalStore, KindRegistry, MemoryStore};
use uuid::Uuid;

fn page_view(url: &str) -> NewHit {
    NewHit::new(Uuid::new_v4(), url, Utc::now()).with_attributes(HitAttributes {
        session_id: Some(Uuid::new_v4().to_string()),
        username: Some("bob".into()),
        browser: Some("Whatevs".into()),
        device_model: Some("Whoever".into()),
        client_os: Some("Win".into()),
    })
}

fn unique_url() -> String {
    format!("http://whatever/{}", Uuid::new_v4())
}

#[tokio::test]
async fn duplicate_urls_block_batch_until_consolidated() {
    let store = MemoryStore::legacy();
    bootstrap::run(&store).await.unwrap();

    let url = unique_url();
    let url_dup1 = store.seed_resource(&url, None).await;
    let url_dup2 = store.seed_resource(&url, Some(Utc::now())).await;

    // Linked records on the newer duplicate, one of every registered kind.
    let registry = KindRegistry::default();
    let mut linked = Vec::new();
    for kind in registry.kinds().iter().filter(|k| k.name != "hits") {
        linked.push((kind.clone(), store.seed_dependent(kind, url_dup2.id).await.unwrap()));
    }

    let ingestor = BatchIngestor::new(store.clone());
    let consolidator = Consolidator::new(store.clone(), registry);

    let batch = Batch::new(vec![page_view(&url), page_view(&url)]);
    let hits_before = store.count_hits().await.unwrap();

    let failure = ingestor.save_batch(&batch).await.unwrap_err();
    assert!(failure.has_ambiguous_resources());
    let persisted_first = failure.persisted as i64;
    assert_eq!(store.count_hits().await.unwrap(), hits_before + persisted_first);

    let report = consolidator.consolidate().await.unwrap();
    assert!(report.is_clean());

    let retry = ingestor.save_batch(&batch).await.unwrap();
    assert_eq!(retry.persisted + retry.skipped_existing, batch.len());

    // Net +2 across both calls: never +1, never +3.
    assert_eq!(
        store.count_hits().await.unwrap(),
        hits_before + batch.distinct_request_ids() as i64
    );

    assert!(store.resource(url_dup1.id).await.is_some(), "URL 1 should survive");
    assert!(store.resource(url_dup2.id).await.is_none(), "URL 2 should be gone");
    for (kind, record_id) in &linked {
        assert_eq!(
            store.dependent_reference(kind, *record_id).await,
            Some(url_dup1.id),
            "{} record should survive on URL 1",
            kind.name
        );
    }
}

#[tokio::test]
async fn retry_after_partial_success_does_not_duplicate() {
    let store = MemoryStore::new();
    let dup_url = unique_url();
    store.seed_resource(&dup_url, None).await;
    store.seed_resource(&dup_url, None).await;

    let ingestor = BatchIngestor::new(store.clone());
    let batch = Batch::new(vec![
        page_view(&unique_url()),
        page_view(&dup_url),
        page_view(&unique_url()),
        page_view(&dup_url),
    ]);

    let first = ingestor.save_batch(&batch).await.unwrap_err();
    assert_eq!(first.persisted, 2);
    assert_eq!(store.count_hits().await.unwrap(), 2);

    Consolidator::new(store.clone(), KindRegistry::default())
        .consolidate()
        .await
        .unwrap();

    let retry = ingestor.save_batch(&batch).await.unwrap();
    assert_eq!(retry.persisted, 2);
    assert_eq!(retry.skipped_existing, 2);
    assert_eq!(store.count_hits().await.unwrap(), 4);
}

#[tokio::test]
async fn hits_sharing_a_url_are_not_duplicates_of_each_other() {
    let store = MemoryStore::new();
    let url = unique_url();
    store.seed_resource(&url, None).await;
    store.seed_resource(&url, None).await;

    let ingestor = BatchIngestor::new(store.clone());
    let consolidator = Consolidator::new(store.clone(), KindRegistry::default());
    let batch = Batch::new(vec![page_view(&url), page_view(&url)]);

    let outcome = ingest_with_recovery(&ingestor, &consolidator, &batch)
        .await
        .unwrap();

    match &outcome {
        RecoveryOutcome::Recovered {
            first_attempt,
            consolidation,
            retry,
        } => {
            assert_eq!(first_attempt.failures.len(), 2);
            assert_eq!(consolidation.groups_merged, 1);
            assert_eq!(retry.persisted, 2);
        }
        other => panic!("expected recovery, got {other:?}"),
    }
    assert_eq!(outcome.total_persisted(), 2);

    let hits = store.hits().await;
    assert_eq!(hits.len(), 2);
    assert_ne!(hits[0].request_id, hits[1].request_id);
    assert_eq!(hits[0].resource_id, hits[1].resource_id);
}

#[tokio::test]
async fn clean_batch_needs_no_recovery() {
    let store = MemoryStore::new();
    let ingestor = BatchIngestor::new(store.clone());
    let consolidator = Consolidator::new(store.clone(), KindRegistry::default());

    let outcome = ingest_with_recovery(
        &ingestor,
        &consolidator,
        &Batch::new(vec![page_view(&unique_url())]),
    )
    .await
    .unwrap();

    assert!(matches!(outcome, RecoveryOutcome::Clean(ref r) if r.persisted == 1));
}

#[tokio::test]
async fn failures_consolidation_cannot_fix_are_returned_untouched() {
    let store = MemoryStore::new();
    let ingestor = BatchIngestor::new(store.clone());
    let consolidator = Consolidator::new(store.clone(), KindRegistry::default());

    let batch = Batch::new(vec![
        page_view(&unique_url()),
        NewHit::new(Uuid::nil(), unique_url(), Utc::now()),
    ]);
    let err = ingest_with_recovery(&ingestor, &consolidator, &batch)
        .await
        .unwrap_err();

    match err {
        RecoveryError::NotRecoverable(failure) => {
            assert_eq!(failure.persisted, 1);
            assert_eq!(failure.failures.len(), 1);
        }
        other => panic!("expected NotRecoverable, got {other:?}"),
    }
}

#[tokio::test]
async fn retry_still_failing_is_reported_with_both_attempts() {
    let store = MemoryStore::new();
    let url = unique_url();
    let a = store.seed_resource(&url, None).await;
    let b = store.seed_resource(&url, None).await;
    // Both duplicates carry a comment; comment rewrites fail, so the group
    // cannot merge and the retry stays ambiguous.
    let registry = KindRegistry::default();
    let comments = registry.get("page_comments").cloned().unwrap();
    store.seed_dependent(&comments, a.id).await.unwrap();
    store.seed_dependent(&comments, b.id).await.unwrap();
    store.fail_rewrites_for("page_comments").await;

    let ingestor = BatchIngestor::new(store.clone());
    let consolidator = Consolidator::new(store.clone(), registry);
    let batch = Batch::new(vec![page_view(&url)]);

    let err = ingest_with_recovery(&ingestor, &consolidator, &batch)
        .await
        .unwrap_err();

    match err {
        RecoveryError::RetryFailed {
            consolidation,
            failure,
            ..
        } => {
            assert_eq!(consolidation.failures.len(), 1);
            assert!(failure.has_ambiguous_resources());
        }
        other => panic!("expected RetryFailed, got {other:?}"),
    }
    assert_eq!(store.count_hits().await.unwrap(), 0);
}
