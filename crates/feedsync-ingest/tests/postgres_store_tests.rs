//! PostgreSQL store tests
//!
//! Each test starts its own PostgreSQL container and applies the workspace
//! migrations. Run with `cargo test -- --ignored` when Docker is available.

mod common;

use common::init_test_tracing;
use feedsync_common::types::{FetchResult, Watermark};
use feedsync_ingest::config::StoreConfig;
use feedsync_ingest::error::CommitError;
use feedsync_ingest::store::{ArchiveStore, PostgresStore};
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

async fn start_store(config: StoreConfig) -> (ContainerAsync<Postgres>, PostgresStore) {
    init_test_tracing();

    let container = Postgres::default()
        .start()
        .await
        .expect("Failed to start PostgreSQL container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432.tcp())
        .await
        .expect("container port");

    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
    let store = PostgresStore::connect(&url, config)
        .await
        .expect("Failed to connect to PostgreSQL");
    store.migrate().await.expect("Failed to run migrations");

    (container, store)
}

fn result(key: &str, records: &[&str]) -> FetchResult {
    FetchResult::new(key, records.iter().map(|r| r.to_string()).collect())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_fresh_store_has_empty_watermark() {
    let (_container, store) = start_store(StoreConfig::default()).await;

    assert_eq!(store.load_watermark().await.unwrap(), Watermark::empty());
    assert_eq!(store.document_count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_commits_chain_and_persist() {
    let (_container, store) = start_store(StoreConfig::default()).await;

    let first = store
        .commit(&Watermark::empty(), &result("a.zip", &["<a1/>", "<a2/>"]))
        .await
        .unwrap();
    assert_eq!(first, Watermark::at("a.zip", 1));

    let second = store
        .commit(&first, &result("b.zip", &["<b1/>"]))
        .await
        .unwrap();
    assert_eq!(second, Watermark::at("b.zip", 2));

    // An archive without documents still moves the watermark
    let third = store.commit(&second, &result("c.zip", &[])).await.unwrap();
    assert_eq!(third, Watermark::at("c.zip", 3));

    assert_eq!(store.load_watermark().await.unwrap(), third);
    assert_eq!(store.document_count().await.unwrap(), 3);

    let bodies: Vec<String> = sqlx::query_scalar(
        "SELECT body FROM feed_documents WHERE list_key = $1 ORDER BY id",
    )
    .bind("NEWS_XML")
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(bodies, vec!["<a1/>", "<a2/>", "<b1/>"]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stale_watermark_is_rejected_and_rolled_back() {
    let (_container, store) = start_store(StoreConfig::default()).await;

    let start = store.load_watermark().await.unwrap();
    store.commit(&start, &result("a.zip", &["<a/>"])).await.unwrap();

    // A second writer still holding the old watermark
    let err = store
        .commit(&start, &result("b.zip", &["<b/>"]))
        .await
        .unwrap_err();
    match err {
        CommitError::Conflict(conflict) => {
            assert_eq!(conflict.expected_revision, 0);
            assert_eq!(conflict.found_revision, Some(1));
        },
        other => panic!("expected conflict, got {other:?}"),
    }

    assert_eq!(store.load_watermark().await.unwrap(), Watermark::at("a.zip", 1));
    assert_eq!(store.document_count().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lists_are_isolated_by_key() {
    let (_container, store) = start_store(StoreConfig::default()).await;
    let other = PostgresStore::new(
        store.pool().clone(),
        StoreConfig {
            list_key: "OTHER_XML".to_string(),
            watermark_key: "OTHER_XML_LATEST".to_string(),
        },
    );

    store
        .commit(&Watermark::empty(), &result("a.zip", &["<a/>"]))
        .await
        .unwrap();

    assert_eq!(other.load_watermark().await.unwrap(), Watermark::empty());
    assert_eq!(other.document_count().await.unwrap(), 0);
    assert_eq!(store.document_count().await.unwrap(), 1);
}
