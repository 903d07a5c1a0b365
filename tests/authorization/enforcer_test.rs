//! Role assignment semantics and concurrent access.

use std::sync::Arc;

use runvoy::authorization::{Action, Enforcer, PolicyEnforcer, PolicyTable, ResourceKind, Role};

fn enforcer() -> Arc<PolicyEnforcer> {
    let table = PolicyTable::builtin().expect("parse");
    Arc::new(PolicyEnforcer::new(&table))
}

#[test]
fn unknown_subject_is_denied_without_error() {
    let enforcer = enforcer();
    let allowed = enforcer
        .enforce("ghost@example.com", &ResourceKind::Executions.collection_path(), Action::Read)
        .expect("enforce");
    assert!(!allowed);
}

#[test]
fn last_assignment_wins() {
    let enforcer = enforcer();
    let users = ResourceKind::Users.collection_path();

    enforcer.add_role_for_user("alice@example.com", Role::Admin).expect("assign");
    assert!(enforcer.enforce("alice@example.com", &users, Action::Read).expect("enforce"));

    enforcer.add_role_for_user("alice@example.com", Role::Viewer).expect("assign");
    assert!(!enforcer.enforce("alice@example.com", &users, Action::Read).expect("enforce"));
    assert_eq!(
        enforcer.role_for_user("alice@example.com").expect("lookup"),
        Some(Role::Viewer)
    );
}

#[test]
fn assignment_is_idempotent() {
    let enforcer = enforcer();
    enforcer.add_role_for_user("bob@example.com", Role::Developer).expect("assign");
    enforcer.add_role_for_user("bob@example.com", Role::Developer).expect("assign");
    assert_eq!(
        enforcer.role_for_user("bob@example.com").expect("lookup"),
        Some(Role::Developer)
    );
}

#[test]
fn removed_subject_is_denied() {
    let enforcer = enforcer();
    let executions = ResourceKind::Executions.collection_path();
    enforcer.add_role_for_user("carol@example.com", Role::Viewer).expect("assign");
    assert_eq!(
        enforcer.remove_role_for_user("carol@example.com").expect("remove"),
        Some(Role::Viewer)
    );
    assert!(!enforcer.enforce("carol@example.com", &executions, Action::Read).expect("enforce"));
}

#[test]
fn empty_subject_is_rejected() {
    let enforcer = enforcer();
    let err = enforcer.add_role_for_user("  ", Role::Admin).expect_err("must fail");
    assert_eq!(err.kind(), runvoy::ErrorKind::InvalidRequest);
}

#[test]
fn bulk_load_counts_assignments() {
    let enforcer = enforcer();
    let loaded = enforcer
        .load_assignments(vec![
            ("a@example.com".to_owned(), Role::Admin),
            ("b@example.com".to_owned(), Role::Viewer),
        ])
        .expect("load");
    assert_eq!(loaded, 2);
    assert_eq!(enforcer.role_for_user("b@example.com").expect("lookup"), Some(Role::Viewer));
}

#[test]
fn concurrent_reads_see_writes() {
    let enforcer = enforcer();
    let executions = ResourceKind::Executions.collection_path();

    let readers: Vec<_> = (0..8)
        .map(|i| {
            let enforcer = Arc::clone(&enforcer);
            let executions = executions.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let _ = enforcer
                        .enforce(&format!("user{i}@example.com"), &executions, Action::Read)
                        .expect("enforce");
                }
            })
        })
        .collect();

    for i in 0..8 {
        enforcer
            .add_role_for_user(&format!("user{i}@example.com"), Role::Viewer)
            .expect("assign");
    }
    for reader in readers {
        reader.join().expect("reader thread");
    }

    for i in 0..8 {
        assert!(enforcer
            .enforce(&format!("user{i}@example.com"), &executions, Action::Read)
            .expect("enforce"));
    }
}
