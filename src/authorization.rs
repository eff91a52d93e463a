use serde::Serialize;
use std::collections::BTreeSet;

use crate::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Allow iff the caller holds one of the required roles.
pub fn authorize(required_roles: &BTreeSet<Role>, caller_role: Option<&Role>) -> Decision {
    match caller_role {
        Some(role) if required_roles.contains(role) => Decision::Allow,
        _ => Decision::Deny,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicy {
    /// Readable by anyone, including anonymous callers. Never valid on mutations.
    Public,
    Roles(BTreeSet<Role>),
}

impl Default for AccessPolicy {
    fn default() -> Self {
        AccessPolicy::deny_all()
    }
}

impl AccessPolicy {
    pub fn roles<I, R>(roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Role>,
    {
        AccessPolicy::Roles(roles.into_iter().map(Into::into).collect())
    }

    pub fn deny_all() -> Self {
        AccessPolicy::Roles(BTreeSet::new())
    }

    pub fn is_public(&self) -> bool {
        matches!(self, AccessPolicy::Public)
    }

    pub fn check(&self, caller_role: Option<&Role>) -> Decision {
        match self {
            AccessPolicy::Public => Decision::Allow,
            AccessPolicy::Roles(required) => authorize(required, caller_role),
        }
    }
}
