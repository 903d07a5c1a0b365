//! Role-based access control.
//!
//! Permissions are `(role, object pattern, action)` tuples loaded once from a
//! static policy table ([`policy`]). Subjects (user emails) are mapped to exactly
//! one [`Role`] by the [`enforcer::PolicyEnforcer`]. The
//! [`validator::ResourceAccessValidator`] layers execution-time `use` checks for
//! images and secrets on top of the enforcer.

pub mod enforcer;
pub mod policy;
pub mod validator;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use enforcer::{Enforcer, PolicyEnforcer};
pub use policy::{ObjectPattern, PolicyRule, PolicyTable};
pub use validator::{AccessGrant, ResourceAccessValidator};

/// Prefix shared by every resource path.
pub const API_PREFIX: &str = "/api/v1";

/// Role assigned to a user. A user holds exactly one role at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full access, including user management.
    Admin,
    /// Manages images, secrets and executions; no user management.
    Operator,
    /// Runs and manages executions, may use images and secrets.
    Developer,
    /// Read-only access to executions.
    Viewer,
}

impl Role {
    /// Every role, in descending privilege order.
    pub const ALL: [Role; 4] = [Role::Admin, Role::Operator, Role::Developer, Role::Viewer];

    /// Returns the string representation stored in repositories and policy files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Operator => "operator",
            Self::Developer => "developer",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "admin" => Ok(Self::Admin),
            "operator" => Ok(Self::Operator),
            "developer" => Ok(Self::Developer),
            "viewer" => Ok(Self::Viewer),
            other => Err(Error::InvalidRequest(format!(
                "unknown role {other:?}; expected one of admin, operator, developer, viewer"
            ))),
        }
    }
}

/// Action component of an authorization query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Browse a collection or read one instance.
    Read,
    /// Create an instance in a collection.
    Create,
    /// Modify an instance.
    Update,
    /// Delete (or kill) an instance.
    Delete,
    /// Consume an image or secret during an execution.
    Use,
}

impl Action {
    /// Every action.
    pub const ALL: [Action; 5] = [
        Action::Read,
        Action::Create,
        Action::Update,
        Action::Delete,
        Action::Use,
    ];

    /// Returns the string representation used in policy files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Use => "use",
        }
    }

    /// Map an HTTP method to the action checked at the routing boundary.
    pub fn from_method(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" | "HEAD" => Some(Self::Read),
            "POST" => Some(Self::Create),
            "PUT" | "PATCH" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource types addressable by policy objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// User accounts.
    Users,
    /// Registered container images.
    Images,
    /// Named secrets.
    Secrets,
    /// Command executions.
    Executions,
}

impl ResourceKind {
    /// Every resource type.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Users,
        ResourceKind::Images,
        ResourceKind::Secrets,
        ResourceKind::Executions,
    ];

    /// Path segment naming this resource type.
    pub fn segment(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Images => "images",
            Self::Secrets => "secrets",
            Self::Executions => "executions",
        }
    }

    /// Object string for collection-level checks, e.g. `/api/v1/images`.
    pub fn collection_path(&self) -> String {
        format!("{API_PREFIX}/{}", self.segment())
    }

    /// Object string for instance-level checks, e.g. `/api/v1/images/ubuntu-22.04-1a2b3c4d`.
    ///
    /// The identifier is embedded verbatim; it may contain `:` or `/`.
    pub fn instance_path(&self, id: &str) -> String {
        format!("{API_PREFIX}/{}/{id}", self.segment())
    }
}
