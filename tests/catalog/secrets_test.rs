//! Secret lifecycle and validation.

use std::sync::Arc;

use runvoy::catalog::secrets::MAX_SECRET_VALUE_SIZE;
use runvoy::catalog::SecretCatalog;
use runvoy::store::memory::MemoryStore;
use runvoy::ErrorKind;

fn catalog() -> SecretCatalog {
    SecretCatalog::new(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn created_secret_lists_without_value() {
    let catalog = catalog();
    let created = catalog
        .create_secret("ops@example.com", "db-password", "hunter2", "primary db")
        .await
        .expect("create");
    assert_eq!(created.owners, vec!["ops@example.com".to_owned()]);

    let listed = catalog.list_secrets().await.expect("list");
    assert_eq!(listed.len(), 1);
    let json = serde_json::to_string(&listed).expect("serialize");
    assert!(!json.contains("hunter2"));

    let secret = catalog.get_secret("db-password").await.expect("get");
    assert_eq!(secret.value, "hunter2");
    assert!(!format!("{secret:?}").contains("hunter2"));
}

#[tokio::test]
async fn duplicate_name_conflicts() {
    let catalog = catalog();
    catalog
        .create_secret("ops@example.com", "api-token", "a", "")
        .await
        .expect("create");
    let err = catalog
        .create_secret("ops@example.com", "api-token", "b", "")
        .await
        .expect_err("duplicate");
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn invalid_names_and_values_are_rejected() {
    let catalog = catalog();
    for (name, value) in [
        ("bad name", "v"),
        ("", "v"),
        ("ok-name", ""),
    ] {
        let err = catalog
            .create_secret("ops@example.com", name, value, "")
            .await
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{name:?}/{value:?}");
    }

    let oversized = "x".repeat(MAX_SECRET_VALUE_SIZE.saturating_add(1));
    let err = catalog
        .create_secret("ops@example.com", "big", &oversized, "")
        .await
        .expect_err("too large");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn update_changes_value_and_updater() {
    let catalog = catalog();
    catalog
        .create_secret("ops@example.com", "db-password", "old", "")
        .await
        .expect("create");

    catalog
        .update_secret("admin@example.com", "db-password", Some("new"), None)
        .await
        .expect("update");

    let secret = catalog.get_secret("db-password").await.expect("get");
    assert_eq!(secret.value, "new");
    assert_eq!(secret.updated_by, "admin@example.com");
    assert_eq!(secret.created_by, "ops@example.com");
}

#[tokio::test]
async fn empty_update_is_rejected() {
    let catalog = catalog();
    let err = catalog
        .update_secret("admin@example.com", "db-password", None, None)
        .await
        .expect_err("nothing to change");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn delete_then_lookup_is_not_found() {
    let catalog = catalog();
    catalog
        .create_secret("ops@example.com", "db-password", "v", "")
        .await
        .expect("create");
    catalog.delete_secret("db-password").await.expect("delete");

    let err = catalog.get_secret("db-password").await.expect_err("deleted");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = catalog.delete_secret("db-password").await.expect_err("deleted twice");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
