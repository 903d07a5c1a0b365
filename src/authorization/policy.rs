//! Static role permission table and object pattern matching.
//!
//! The table is a flat list of `(role, pattern, action)` tuples. Patterns come in
//! exactly two forms:
//!
//! - exact: `/api/v1/images` matches only that string;
//! - prefix + wildcard: `/api/v1/images/*` matches any object starting with
//!   `/api/v1/images/`, with the remainder taken verbatim (it may contain `:`,
//!   `/` or any other punctuation, and may be empty).
//!
//! There is no explicit deny. A query is allowed when at least one rule of the
//! subject's role matches both object and action.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use super::{Action, Role};

/// Built-in permission table, embedded at compile time.
pub const DEFAULT_POLICY: &str = include_str!("default_policy.toml");

/// Wildcard suffix marking a prefix pattern.
const WILDCARD: char = '*';

/// Errors raised while loading a policy table.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy file could not be read.
    #[error("failed to read policy file {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The policy document is not valid TOML for the expected shape.
    #[error("failed to parse policy table: {0}")]
    Parse(#[from] toml::de::Error),

    /// A pattern uses the wildcard somewhere other than the final position.
    #[error("invalid object pattern {0:?}: '*' is only allowed as the final character")]
    InvalidPattern(String),

    /// A rule lists no objects or no actions.
    #[error("rule for role {0} must list at least one object and one action")]
    EmptyRule(Role),
}

/// Object side of a policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectPattern {
    /// Matches the object string exactly.
    Exact(String),
    /// Matches any object starting with the stored prefix.
    Prefix(String),
}

impl ObjectPattern {
    /// Parse a pattern string.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPattern`] when `*` appears anywhere but the
    /// last character.
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let raw = raw.trim();
        match raw.strip_suffix(WILDCARD) {
            Some(prefix) if !prefix.contains(WILDCARD) => Ok(Self::Prefix(prefix.to_owned())),
            Some(_) => Err(PolicyError::InvalidPattern(raw.to_owned())),
            None if raw.contains(WILDCARD) => Err(PolicyError::InvalidPattern(raw.to_owned())),
            None => Ok(Self::Exact(raw.to_owned())),
        }
    }

    /// Returns `true` when `object` is matched by this pattern.
    pub fn matches(&self, object: &str) -> bool {
        match self {
            Self::Exact(exact) => object == exact,
            Self::Prefix(prefix) => object.starts_with(prefix.as_str()),
        }
    }

    /// Returns `true` for prefix patterns.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Prefix(_))
    }
}

impl fmt::Display for ObjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Prefix(prefix) => write!(f, "{prefix}{WILDCARD}"),
        }
    }
}

/// A single permission tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyRule {
    /// Role the permission is attached to.
    pub role: Role,
    /// Objects the permission covers.
    pub pattern: ObjectPattern,
    /// Permitted action.
    pub action: Action,
}

impl PolicyRule {
    /// Returns `true` when this rule allows `action` on `object`.
    pub fn allows(&self, object: &str, action: Action) -> bool {
        self.action == action && self.pattern.matches(object)
    }
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    rules: Vec<RuleGroup>,
}

#[derive(Debug, Deserialize)]
struct RuleGroup {
    role: Role,
    objects: Vec<String>,
    actions: Vec<Action>,
}

/// Exact rule without a wildcard sibling for the same role and action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageGap {
    /// Role holding the exact rule.
    pub role: Role,
    /// The exact collection path.
    pub collection: String,
    /// The action granted on the collection only.
    pub action: Action,
}

/// The full set of permission tuples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
}

impl PolicyTable {
    /// Build a table from explicit rules.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        let unique: BTreeSet<PolicyRule> = rules.into_iter().collect();
        Self {
            rules: unique.into_iter().collect(),
        }
    }

    /// Parse the built-in table.
    ///
    /// # Errors
    ///
    /// Returns an error only if the embedded document is malformed.
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::from_toml_str(DEFAULT_POLICY)
    }

    /// Parse a TOML policy document.
    ///
    /// Each `[[rules]]` group lists one role, several objects and several actions
    /// and expands to the cross product of objects × actions.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed TOML, invalid patterns or empty groups.
    pub fn from_toml_str(raw: &str) -> Result<Self, PolicyError> {
        let document: PolicyDocument = toml::from_str(raw)?;
        let mut rules = Vec::new();
        for group in document.rules {
            if group.objects.is_empty() || group.actions.is_empty() {
                return Err(PolicyError::EmptyRule(group.role));
            }
            for object in &group.objects {
                let pattern = ObjectPattern::parse(object)?;
                for action in &group.actions {
                    rules.push(PolicyRule {
                        role: group.role,
                        pattern: pattern.clone(),
                        action: *action,
                    });
                }
            }
        }
        Ok(Self::new(rules))
    }

    /// Load a TOML policy document from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// All rules, sorted and de-duplicated.
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Rules attached to one role.
    pub fn rules_for(&self, role: Role) -> impl Iterator<Item = &PolicyRule> {
        self.rules.iter().filter(move |rule| rule.role == role)
    }

    /// Exact rules whose `<path>/*` sibling is missing for the same role and action.
    ///
    /// Such a table grants collection access while silently refusing every
    /// instance of the same resource type.
    pub fn coverage_gaps(&self) -> Vec<CoverageGap> {
        self.rules
            .iter()
            .filter_map(|rule| match &rule.pattern {
                ObjectPattern::Exact(path) => {
                    let sibling = ObjectPattern::Prefix(format!("{path}/"));
                    let covered = self.rules.iter().any(|other| {
                        other.role == rule.role
                            && other.action == rule.action
                            && other.pattern == sibling
                    });
                    (!covered).then(|| CoverageGap {
                        role: rule.role,
                        collection: path.clone(),
                        action: rule.action,
                    })
                }
                ObjectPattern::Prefix(_) => None,
            })
            .collect()
    }
}
