//! Repository contract for SQLite, plus on-disk persistence.

use runvoy::execution::ExecutionStatus;
use runvoy::store::sqlite::SqliteStore;
use runvoy::store::{ExecutionRepository, ImageRepository};

use crate::contract;

async fn store() -> SqliteStore {
    SqliteStore::in_memory().await.expect("in-memory sqlite")
}

#[tokio::test]
async fn users() {
    contract::users_round_trip(&store().await).await;
}

#[tokio::test]
async fn pending_keys() {
    contract::pending_keys_claim_once(&store().await).await;
}

#[tokio::test]
async fn execution_listing() {
    contract::executions_list_newest_first(&store().await).await;
}

#[tokio::test]
async fn execution_updates() {
    contract::executions_update_in_place(&store().await).await;
}

#[tokio::test]
async fn images() {
    contract::images_keep_a_single_default(&store().await).await;
}

#[tokio::test]
async fn secrets() {
    contract::secrets_round_trip(&store().await).await;
}

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("runvoy.db");

    {
        let store = SqliteStore::open(&path).await.expect("open");
        contract::executions_list_newest_first(&store).await;
        store.pool().close().await;
    }

    let reopened = SqliteStore::open(&path).await.expect("reopen");
    let running = reopened
        .list_executions(None, &[ExecutionStatus::Running])
        .await
        .expect("list");
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].execution_id, "exec-2");
    assert_eq!(reopened.get_default_image().await.expect("default"), None);
}
