//! Integration tests for search ranking and the daily brief

use chrono::{Duration, Utc};
use engram::memory::retrieval::{self, BRIEF_CAP};
use engram::memory::types::Tier;
use engram::storage::{LanceStore, RecordFilter};
use engram::testing::{TEST_DIMENSION, embedded_record, test_embedder};
use tempfile::tempdir;

async fn create_test_store() -> (std::sync::Arc<LanceStore>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let store = engram::testing::open_test_store(dir.path()).await.unwrap();
    (store, dir)
}

mod search_tests {
    use super::*;

    #[tokio::test]
    async fn test_search_finds_exact_content() {
        let (store, _dir) = create_test_store().await;

        let target = embedded_record("pref", "user prefers tabs over spaces", Tier::MediumTerm);
        let noise = embedded_record("noise", "grocery list for the weekend", Tier::MediumTerm);
        store.insert_batch(&[target.clone(), noise]).await.unwrap();

        let hits = retrieval::search(
            &store,
            test_embedder(),
            "user prefers tabs over spaces",
            RecordFilter::new(),
            5,
        )
        .await
        .unwrap();

        assert!(!hits.is_empty());
        assert_eq!(hits[0].record.id, target.id);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        assert!(hits[0].score <= 1.0 + 1e-6);
    }

    #[tokio::test]
    async fn test_search_touches_returned_records() {
        let (store, _dir) = create_test_store().await;

        let record = embedded_record("seen", "a record that gets read", Tier::ShortTerm);
        store.insert(&record).await.unwrap();

        retrieval::search(
            &store,
            test_embedder(),
            "a record that gets read",
            RecordFilter::new(),
            1,
        )
        .await
        .unwrap();

        let touched = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(touched.access_count, 1);
    }

    #[tokio::test]
    async fn test_search_caps_results_at_k_with_excess_candidates() {
        let (store, _dir) = create_test_store().await;

        let records: Vec<_> = (0..10)
            .map(|i| {
                embedded_record(
                    &format!("n{i}"),
                    &format!("kubernetes cluster upgrade note {i}"),
                    Tier::MediumTerm,
                )
            })
            .collect();
        store.insert_batch(&records).await.unwrap();

        let hits = retrieval::search(
            &store,
            test_embedder(),
            "kubernetes cluster upgrade note",
            RecordFilter::new(),
            5,
        )
        .await
        .unwrap();

        assert_eq!(hits.len(), 5);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_search_equal_similarity_prefers_higher_tier() {
        let (store, _dir) = create_test_store().await;

        // identical content, so identical hash embeddings and similarity
        let mut permanent = embedded_record("p", "shared content", Tier::Permanent);
        permanent.confidence = 0.9;
        let mut session = embedded_record("s", "shared content", Tier::Session);
        session.confidence = 0.9;
        store.insert_batch(&[permanent.clone(), session.clone()]).await.unwrap();

        let hits = retrieval::search(
            &store,
            test_embedder(),
            "shared content",
            RecordFilter::new(),
            2,
        )
        .await
        .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, permanent.id);
        assert_eq!(hits[1].record.id, session.id);
    }

    #[tokio::test]
    async fn test_search_respects_tier_filter() {
        let (store, _dir) = create_test_store().await;

        let long = embedded_record("l", "filter target content", Tier::LongTerm);
        let short = embedded_record("s", "filter target content", Tier::ShortTerm);
        store.insert_batch(&[long.clone(), short]).await.unwrap();

        let hits = retrieval::search(
            &store,
            test_embedder(),
            "filter target content",
            RecordFilter::new().with_tiers(vec![Tier::LongTerm]),
            10,
        )
        .await
        .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, long.id);
    }

    #[tokio::test]
    async fn test_search_excludes_forgotten_records() {
        let (store, _dir) = create_test_store().await;

        let record = embedded_record("f", "forgotten but indexed", Tier::MediumTerm);
        store.insert(&record).await.unwrap();
        store
            .mark_forgotten(record.id, "obsolete", Tier::ShortTerm, Utc::now())
            .await
            .unwrap();

        let hits = retrieval::search(
            &store,
            test_embedder(),
            "forgotten but indexed",
            RecordFilter::new(),
            10,
        )
        .await
        .unwrap();

        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_rejects_empty_query_and_zero_k() {
        let (store, _dir) = create_test_store().await;

        assert!(
            retrieval::search(&store, test_embedder(), "  ", RecordFilter::new(), 5)
                .await
                .is_err()
        );
        assert!(
            retrieval::search(&store, test_embedder(), "ok", RecordFilter::new(), 0)
                .await
                .is_err()
        );
    }
}

mod brief_tests {
    use super::*;

    #[tokio::test]
    async fn test_brief_includes_recent_excludes_session() {
        let (store, _dir) = create_test_store().await;

        let recent = embedded_record("recent", "fresh medium-term note", Tier::MediumTerm);
        let scratch = embedded_record("scratch", "session scratch", Tier::Session);
        let mut old = embedded_record("old", "ancient note", Tier::LongTerm);
        old.created_at = Utc::now() - Duration::days(10);
        old.last_used_at = old.created_at;
        store.insert_batch(&[recent.clone(), scratch, old]).await.unwrap();

        let items = retrieval::daily_brief(&store, 24, BRIEF_CAP).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].record.id, recent.id);
    }

    #[tokio::test]
    async fn test_brief_is_capped() {
        let (store, _dir) = create_test_store().await;

        let records: Vec<_> = (0..25)
            .map(|i| embedded_record(&format!("r{i}"), &format!("note {i}"), Tier::ShortTerm))
            .collect();
        store.insert_batch(&records).await.unwrap();

        let items = retrieval::daily_brief(&store, 24, BRIEF_CAP).await.unwrap();
        assert_eq!(items.len(), BRIEF_CAP);
    }

    #[tokio::test]
    async fn test_brief_does_not_count_as_access() {
        let (store, _dir) = create_test_store().await;

        let record = embedded_record("quiet", "browsed not used", Tier::ShortTerm);
        store.insert(&record).await.unwrap();

        retrieval::daily_brief(&store, 24, BRIEF_CAP).await.unwrap();

        let unchanged = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(unchanged.access_count, 0);
    }

    #[tokio::test]
    async fn test_brief_orders_by_relevance() {
        let (store, _dir) = create_test_store().await;

        let mut confident = embedded_record("c", "high confidence note", Tier::MediumTerm);
        confident.confidence = 1.0;
        let mut doubtful = embedded_record("d", "low confidence note", Tier::MediumTerm);
        doubtful.confidence = 0.1;
        store.insert_batch(&[confident.clone(), doubtful.clone()]).await.unwrap();

        let items = retrieval::daily_brief(&store, 24, BRIEF_CAP).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].record.id, confident.id);
        assert_eq!(items[1].record.id, doubtful.id);
    }

    #[tokio::test]
    async fn test_brief_rejects_zero_window() {
        let (store, _dir) = create_test_store().await;
        assert!(retrieval::daily_brief(&store, 0, BRIEF_CAP).await.is_err());
    }
}
