use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles that grant unrestricted visibility over enabled runbooks.
pub const OPERATOR_ROLES: &[&str] = &["owner", "admin", "maintainer", "operator"];

/// Caller identity handed in by the authentication collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Option<Uuid>,
    pub name: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            roles,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|held| held == role)
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }

    /// Admin-class principals bypass per-runbook restrictions.
    pub fn is_operator_class(&self) -> bool {
        OPERATOR_ROLES.iter().any(|role| self.has_role(role))
    }
}
