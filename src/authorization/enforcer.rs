//! Policy enforcer: role assignments plus permission matching.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, warn};

use super::policy::{PolicyRule, PolicyTable};
use super::{Action, Role};
use crate::error::{Error, Result};

/// Authorization query interface used by the validator and the boundary facade.
pub trait Enforcer: Send + Sync {
    /// Decide whether `subject` may perform `action` on `object`.
    ///
    /// Denial is `Ok(false)`. An error means the decision itself could not be
    /// made (lookup or storage failure).
    fn enforce(&self, subject: &str, object: &str, action: Action) -> Result<bool>;
}

/// In-process enforcer over a static [`PolicyTable`] and a subject → role map.
///
/// Assignments sit behind a [`RwLock`]: many concurrent readers, occasional
/// writers, and every write is visible to the next read. There is no cache.
#[derive(Debug)]
pub struct PolicyEnforcer {
    permissions: HashMap<Role, Vec<PolicyRule>>,
    assignments: RwLock<HashMap<String, Role>>,
}

impl PolicyEnforcer {
    /// Build an enforcer with no role assignments.
    ///
    /// Logs a warning for every exact rule that lacks its wildcard sibling.
    pub fn new(table: &PolicyTable) -> Self {
        for gap in table.coverage_gaps() {
            warn!(
                role = %gap.role,
                collection = %gap.collection,
                action = %gap.action,
                "policy grants collection access without matching instance access"
            );
        }

        let mut permissions: HashMap<Role, Vec<PolicyRule>> = HashMap::new();
        for rule in table.rules() {
            permissions.entry(rule.role).or_default().push(rule.clone());
        }

        Self {
            permissions,
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Assign `role` to `subject`, replacing any previous role.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the assignment lock is poisoned.
    pub fn add_role_for_user(&self, subject: &str, role: Role) -> Result<()> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(Error::InvalidRequest("subject must not be empty".to_owned()));
        }
        let mut assignments = self
            .assignments
            .write()
            .map_err(|_| Error::Internal("role assignment lock poisoned".to_owned()))?;
        let previous = assignments.insert(subject.to_owned(), role);
        debug!(subject, role = %role, previous = ?previous, "role assigned");
        Ok(())
    }

    /// Drop the role assignment for `subject`. Subsequent queries are denied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the assignment lock is poisoned.
    pub fn remove_role_for_user(&self, subject: &str) -> Result<Option<Role>> {
        let mut assignments = self
            .assignments
            .write()
            .map_err(|_| Error::Internal("role assignment lock poisoned".to_owned()))?;
        Ok(assignments.remove(subject.trim()))
    }

    /// Current role of `subject`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the assignment lock is poisoned.
    pub fn role_for_user(&self, subject: &str) -> Result<Option<Role>> {
        let assignments = self
            .assignments
            .read()
            .map_err(|_| Error::Internal("role assignment lock poisoned".to_owned()))?;
        Ok(assignments.get(subject.trim()).copied())
    }

    /// Replace-or-insert many assignments at once (start-up hydration).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the assignment lock is poisoned.
    pub fn load_assignments<I>(&self, assignments: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, Role)>,
    {
        let mut map = self
            .assignments
            .write()
            .map_err(|_| Error::Internal("role assignment lock poisoned".to_owned()))?;
        let mut count: usize = 0;
        for (subject, role) in assignments {
            map.insert(subject.trim().to_owned(), role);
            count = count.saturating_add(1);
        }
        Ok(count)
    }

    /// Whether `role` is permitted `action` on `object`, ignoring assignments.
    pub fn role_allows(&self, role: Role, object: &str, action: Action) -> bool {
        self.permissions
            .get(&role)
            .is_some_and(|rules| rules.iter().any(|rule| rule.allows(object, action)))
    }
}

impl Enforcer for PolicyEnforcer {
    fn enforce(&self, subject: &str, object: &str, action: Action) -> Result<bool> {
        let Some(role) = self.role_for_user(subject)? else {
            debug!(subject, object, action = %action, "no role assigned, denying");
            return Ok(false);
        };
        let allowed = self.role_allows(role, object, action);
        debug!(subject, role = %role, object, action = %action, allowed, "policy decision");
        Ok(allowed)
    }
}
