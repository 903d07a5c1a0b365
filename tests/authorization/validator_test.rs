//! `use` checks on images and secrets at execution time.

use std::sync::Arc;

use runvoy::authorization::{Action, ResourceAccessValidator};
use runvoy::execution::ExecutionRequest;
use runvoy::ErrorKind;

use crate::support::{image, RecordingEnforcer};

fn request_with_secrets(secrets: &[&str]) -> ExecutionRequest {
    ExecutionRequest {
        secrets: secrets.iter().map(|s| (*s).to_owned()).collect(),
        ..ExecutionRequest::new("echo hi")
    }
}

#[test]
fn blank_secrets_never_reach_the_enforcer() {
    let enforcer = Arc::new(RecordingEnforcer::allow_all());
    let validator = ResourceAccessValidator::new(enforcer.clone());

    let grant = validator
        .validate_execution_resource_access(
            "dev@example.com",
            &request_with_secrets(&["", "  ", "valid-secret"]),
            None,
        )
        .expect("allowed");

    assert_eq!(
        enforcer.calls(),
        vec![(
            "dev@example.com".to_owned(),
            "/api/v1/secrets/valid-secret".to_owned(),
            Action::Use
        )]
    );
    assert_eq!(grant.secrets(), ["valid-secret".to_owned()]);
}

#[test]
fn first_denied_secret_stops_the_walk() {
    let enforcer = Arc::new(RecordingEnforcer::deny_all());
    let validator = ResourceAccessValidator::new(enforcer.clone());

    let err = validator
        .validate_execution_resource_access(
            "dev@example.com",
            &request_with_secrets(&["secret1", "secret2"]),
            None,
        )
        .expect_err("denied");

    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(err.resource_id(), Some("secret1"));
    assert!(err.to_string().contains("secret1"));
    assert_eq!(enforcer.objects(), vec!["/api/v1/secrets/secret1".to_owned()]);
}

#[test]
fn nothing_to_check_makes_no_calls() {
    let enforcer = Arc::new(RecordingEnforcer::deny_all());
    let validator = ResourceAccessValidator::new(enforcer.clone());

    let grant = validator
        .validate_execution_resource_access("dev@example.com", &request_with_secrets(&[" "]), None)
        .expect("nothing to deny");

    assert!(enforcer.calls().is_empty());
    assert!(grant.secrets().is_empty());
    assert!(grant.image().is_none());
}

#[test]
fn image_is_checked_by_id_before_secrets() {
    let enforcer = Arc::new(RecordingEnforcer::allow_all());
    let validator = ResourceAccessValidator::new(enforcer.clone());
    let ubuntu = image("ubuntu:22.04", "ubuntu-22.04-abcd1234");

    let grant = validator
        .validate_execution_resource_access(
            "dev@example.com",
            &request_with_secrets(&["db-password"]),
            Some(&ubuntu),
        )
        .expect("allowed");

    assert_eq!(
        enforcer.objects(),
        vec![
            "/api/v1/images/ubuntu-22.04-abcd1234".to_owned(),
            "/api/v1/secrets/db-password".to_owned(),
        ]
    );
    assert_eq!(grant.subject(), "dev@example.com");
    assert_eq!(grant.image().map(|i| i.image_id.as_str()), Some("ubuntu-22.04-abcd1234"));
}

#[test]
fn denied_image_names_the_image_and_skips_secrets() {
    let enforcer = Arc::new(RecordingEnforcer::deny(&["/api/v1/images/ubuntu-22.04-abcd1234"]));
    let validator = ResourceAccessValidator::new(enforcer.clone());
    let ubuntu = image("ubuntu:22.04", "ubuntu-22.04-abcd1234");

    let err = validator
        .validate_execution_resource_access(
            "dev@example.com",
            &request_with_secrets(&["db-password"]),
            Some(&ubuntu),
        )
        .expect_err("denied");

    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(err.resource_id(), Some("ubuntu-22.04-abcd1234"));
    assert_eq!(enforcer.calls().len(), 1);
}

#[test]
fn secret_names_are_trimmed() {
    let enforcer = Arc::new(RecordingEnforcer::allow_all());
    let validator = ResourceAccessValidator::new(enforcer.clone());

    let grant = validator
        .validate_execution_resource_access(
            "dev@example.com",
            &request_with_secrets(&["  api-token "]),
            None,
        )
        .expect("allowed");

    assert_eq!(enforcer.objects(), vec!["/api/v1/secrets/api-token".to_owned()]);
    assert_eq!(grant.secrets(), ["api-token".to_owned()]);
}
