//! Image registration, default selection and resolution.

use std::sync::Arc;

use runvoy::catalog::ImageCatalog;
use runvoy::store::memory::MemoryStore;
use runvoy::ErrorKind;

fn catalog() -> ImageCatalog {
    ImageCatalog::new(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn resolve_is_stable_across_calls() {
    let catalog = catalog();
    let registered = catalog
        .register_image("admin@example.com", "ubuntu:22.04", false)
        .await
        .expect("register");

    let first = catalog.resolve_image("ubuntu:22.04").await.expect("resolve");
    let second = catalog.resolve_image(" ubuntu:22.04 ").await.expect("resolve");
    assert_eq!(first.image_id, registered.image_id);
    assert_eq!(first.image_id, second.image_id);
    assert!(first.image_id.starts_with("ubuntu-22.04-"));
}

#[tokio::test]
async fn resolve_accepts_image_id() {
    let catalog = catalog();
    let registered = catalog
        .register_image("admin@example.com", "ghcr.io/org/tool:1.0", false)
        .await
        .expect("register");

    let resolved = catalog.resolve_image(&registered.image_id).await.expect("resolve");
    assert_eq!(resolved.image, "ghcr.io/org/tool:1.0");
    assert_eq!(resolved.registry.as_deref(), Some("ghcr.io"));
}

#[tokio::test]
async fn blank_reference_without_default_is_not_found() {
    let catalog = catalog();
    catalog
        .register_image("admin@example.com", "alpine:3.20", false)
        .await
        .expect("register");

    let err = catalog.resolve_image("   ").await.expect_err("no default");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn blank_reference_selects_default() {
    let catalog = catalog();
    catalog
        .register_image("admin@example.com", "alpine:3.20", false)
        .await
        .expect("register");
    let ubuntu = catalog
        .register_image("admin@example.com", "ubuntu:22.04", true)
        .await
        .expect("register");
    assert!(ubuntu.is_default);

    let resolved = catalog.resolve_image("").await.expect("default");
    assert_eq!(resolved.image_id, ubuntu.image_id);
}

#[tokio::test]
async fn unregistered_reference_is_never_resolved() {
    let catalog = catalog();
    let err = catalog.resolve_image("debian:12").await.expect_err("unregistered");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn duplicate_registration_conflicts() {
    let catalog = catalog();
    catalog
        .register_image("admin@example.com", "ubuntu:22.04", false)
        .await
        .expect("register");
    let err = catalog
        .register_image("ops@example.com", "ubuntu:22.04", false)
        .await
        .expect_err("duplicate");
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn malformed_reference_is_rejected() {
    let catalog = catalog();
    let err = catalog
        .register_image("admin@example.com", "ubuntu:", false)
        .await
        .expect_err("empty tag");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn setting_default_moves_the_flag() {
    let catalog = catalog();
    let alpine = catalog
        .register_image("admin@example.com", "alpine:3.20", true)
        .await
        .expect("register");
    let ubuntu = catalog
        .register_image("admin@example.com", "ubuntu:22.04", false)
        .await
        .expect("register");

    catalog.set_default_image("ubuntu:22.04").await.expect("set default");

    let images = catalog.list_images().await.expect("list");
    let defaults: Vec<_> = images.iter().filter(|i| i.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].image_id, ubuntu.image_id);
    assert_ne!(defaults[0].image_id, alpine.image_id);
}

#[tokio::test]
async fn removed_image_no_longer_resolves() {
    let catalog = catalog();
    let alpine = catalog
        .register_image("admin@example.com", "alpine:3.20", false)
        .await
        .expect("register");

    catalog.remove_image(&alpine.image_id).await.expect("remove");
    let err = catalog.resolve_image("alpine:3.20").await.expect_err("removed");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = catalog.remove_image("alpine:3.20").await.expect_err("gone");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
