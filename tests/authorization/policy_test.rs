//! Built-in role table: collection expectations and collection/instance lockstep.

use runvoy::authorization::policy::PolicyError;
use runvoy::authorization::{
    Action, Enforcer, ObjectPattern, PolicyEnforcer, PolicyTable, ResourceKind, Role,
};

fn builtin() -> PolicyEnforcer {
    let table = PolicyTable::builtin().expect("built-in policy should parse");
    PolicyEnforcer::new(&table)
}

fn expected_collection_read(role: Role, kind: ResourceKind) -> bool {
    match role {
        Role::Admin => true,
        Role::Operator => kind != ResourceKind::Users,
        Role::Developer | Role::Viewer => kind == ResourceKind::Executions,
    }
}

#[test]
fn collection_read_matches_expectation_table() {
    let enforcer = builtin();
    for role in Role::ALL {
        let subject = format!("{role}@example.com");
        enforcer.add_role_for_user(&subject, role).expect("assign");
        for kind in ResourceKind::ALL {
            let allowed = enforcer
                .enforce(&subject, &kind.collection_path(), Action::Read)
                .expect("enforce");
            assert_eq!(
                allowed,
                expected_collection_read(role, kind),
                "{role} read {}",
                kind.collection_path()
            );
        }
    }
}

#[test]
fn collection_and_instance_forms_move_in_lockstep() {
    let enforcer = builtin();
    for role in Role::ALL {
        for kind in ResourceKind::ALL {
            for action in Action::ALL {
                let collection = enforcer.role_allows(role, &kind.collection_path(), action);
                if !collection {
                    continue;
                }
                for id in ["exec-123", "ubuntu:22.04", "team/db-password"] {
                    assert!(
                        enforcer.role_allows(role, &kind.instance_path(id), action),
                        "{role} has {action} on {} but not on {}",
                        kind.collection_path(),
                        kind.instance_path(id)
                    );
                }
            }
        }
    }
}

#[test]
fn builtin_table_has_no_coverage_gaps() {
    let table = PolicyTable::builtin().expect("parse");
    assert!(table.coverage_gaps().is_empty(), "{:?}", table.coverage_gaps());
}

#[test]
fn developer_may_use_but_not_browse_catalog() {
    let enforcer = builtin();
    for kind in [ResourceKind::Images, ResourceKind::Secrets] {
        assert!(enforcer.role_allows(Role::Developer, &kind.instance_path("anything"), Action::Use));
        assert!(!enforcer.role_allows(Role::Developer, &kind.collection_path(), Action::Read));
        assert!(!enforcer.role_allows(Role::Developer, &kind.instance_path("anything"), Action::Read));
    }
}

#[test]
fn viewer_cannot_create_or_kill_executions() {
    let enforcer = builtin();
    let collection = ResourceKind::Executions.collection_path();
    let instance = ResourceKind::Executions.instance_path("exec-1");
    assert!(!enforcer.role_allows(Role::Viewer, &collection, Action::Create));
    assert!(!enforcer.role_allows(Role::Viewer, &instance, Action::Delete));
}

#[test]
fn missing_wildcard_sibling_is_reported() {
    let table = PolicyTable::from_toml_str(
        r#"
[[rules]]
role = "viewer"
objects = ["/api/v1/images"]
actions = ["read"]
"#,
    )
    .expect("parse");
    let gaps = table.coverage_gaps();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].role, Role::Viewer);
    assert_eq!(gaps[0].collection, "/api/v1/images");
    assert_eq!(gaps[0].action, Action::Read);
}

#[test]
fn wildcard_consumes_colons_and_slashes() {
    let pattern = ObjectPattern::parse("/api/v1/images/*").expect("parse");
    assert!(pattern.matches("/api/v1/images/registry.example.com/team/app:1.2"));
    assert!(pattern.matches("/api/v1/images/"));
    assert!(!pattern.matches("/api/v1/images"));
}

#[test]
fn empty_group_is_rejected() {
    let result = PolicyTable::from_toml_str(
        r#"
[[rules]]
role = "admin"
objects = []
actions = ["read"]
"#,
    );
    assert!(matches!(result, Err(PolicyError::EmptyRule(Role::Admin))));
}

#[test]
fn unknown_action_is_rejected() {
    let result = PolicyTable::from_toml_str(
        r#"
[[rules]]
role = "admin"
objects = ["/api/v1/users"]
actions = ["approve"]
"#,
    );
    assert!(matches!(result, Err(PolicyError::Parse(_))));
}
