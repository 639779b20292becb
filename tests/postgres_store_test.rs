mod common;

use common::get_test_config;
use message_relay::message::MessageRepository;
use message_relay::postgres::PgStore;
use message_relay::Error;

async fn setup_store() -> PgStore {
    tracing_subscriber::fmt()
        .with_env_filter("message_relay=debug")
        .try_init()
        .ok();

    let config = get_test_config();
    let store = PgStore::connect(&config.postgres).await.unwrap();
    store.migrate().await.unwrap();
    store
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_create_get_update() {
    let store = setup_store().await;

    let id = store.create("stored", false).await.unwrap();
    let message = store.get_by_id(id).await.unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.content, "stored");
    assert!(!message.processed);

    store.update_processed(id, true).await.unwrap();
    store.update_processed(id, true).await.unwrap();
    let message = store.get_by_id(id).await.unwrap();
    assert!(message.processed);
    assert_eq!(message.content, "stored");

    store.close().unwrap();
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_unknown_id_is_not_found() {
    let store = setup_store().await;
    let before = store.get_stats().await.unwrap();

    let err = store.update_processed(i32::MAX, true).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { id: i32::MAX }));
    assert!(store.get_by_id(i32::MAX).await.unwrap_err().is_not_found());

    assert_eq!(store.get_stats().await.unwrap(), before);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_stats_track_updates() {
    let store = setup_store().await;
    let before = store.get_stats().await.unwrap();

    let a = store.create("a", false).await.unwrap();
    store.create("b", true).await.unwrap();

    let after_create = store.get_stats().await.unwrap();
    assert_eq!(after_create.all, before.all + 2);
    assert_eq!(after_create.processed, before.processed + 1);

    store.update_processed(a, true).await.unwrap();
    let after_update = store.get_stats().await.unwrap();
    assert_eq!(after_update.processed, before.processed + 2);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn test_migrate_twice() {
    let store = setup_store().await;
    store.migrate().await.unwrap();
}
