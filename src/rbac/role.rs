//! Roles, assignments and scopes.

use std::fmt;

use chrono::{DateTime, Utc};
use gateway_core::permission;
use serde::{Deserialize, Serialize};

/// Breadth at which an assignment applies.
///
/// Serialized as `{"type": "global"}` or `{"type": "team", "id": "platform"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Scope {
    /// Applies at every scope of the assignment's organization
    #[default]
    Global,
    /// Applies within one organization
    Org(String),
    /// Applies within one team
    Team(String),
}

impl Scope {
    /// Whether an assignment at `self` applies when `requested` is asked for.
    ///
    /// With no requested scope every assignment applies. Otherwise a global
    /// assignment always applies and a scoped one only on exact match; there
    /// is no hierarchy between org and team.
    #[must_use]
    pub fn applies_to(&self, requested: Option<&Scope>) -> bool {
        match requested {
            None => true,
            Some(req) => matches!(self, Self::Global) || self == req,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Org(id) => write!(f, "org:{id}"),
            Self::Team(id) => write!(f, "team:{id}"),
        }
    }
}

/// A named permission bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Role id
    pub id: String,
    /// Owning organization; `None` for built-ins
    pub org_id: Option<String>,
    /// Name, unique within its organization (or among built-ins)
    pub name: String,
    /// Description
    pub description: String,
    /// Permission strings
    pub permissions: Vec<String>,
    /// Built-in roles are immutable and visible to every organization
    pub is_builtin: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Role {
    /// Whether members of `org_id` can see and assign this role
    #[must_use]
    pub fn visible_to(&self, org_id: &str) -> bool {
        self.is_builtin || self.org_id.as_deref() == Some(org_id)
    }

    /// First permission of this role granting `required`
    #[must_use]
    pub fn granting(&self, required: &str) -> Option<&str> {
        self.permissions
            .iter()
            .map(String::as_str)
            .find(|p| permission::grants(p, required))
    }
}

/// A role bound to a user at a scope.
///
/// Assignments belong to the organization that made them and never apply to
/// principals of another organization, whatever their scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Assignment id
    pub id: String,
    /// Organization the assignment belongs to
    pub org_id: String,
    /// User
    pub user_id: String,
    /// Role
    pub role_id: String,
    /// Scope
    pub scope: Scope,
    /// Who granted it
    pub granted_by: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Create/update payload for custom roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInput {
    /// Name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Permission strings
    pub permissions: Vec<String>,
}

/// Id of the built-in `admin` role
pub const ADMIN_ROLE_ID: &str = "role_admin";

fn builtin(id: &str, name: &str, description: &str, permissions: &[&str]) -> Role {
    let epoch = DateTime::<Utc>::default();
    Role {
        id: id.to_string(),
        org_id: None,
        name: name.to_string(),
        description: description.to_string(),
        permissions: permissions.iter().map(ToString::to_string).collect(),
        is_builtin: true,
        created_at: epoch,
        updated_at: epoch,
    }
}

/// Roles seeded into every store at startup
#[must_use]
pub fn builtin_roles() -> Vec<Role> {
    vec![
        builtin(ADMIN_ROLE_ID, "admin", "Full access to everything", &[permission::ALL]),
        builtin(
            "role_developer",
            "developer",
            "Call MCP tools and manage own keys",
            &[
                permission::MCP_READ,
                permission::MCP_CALL,
                permission::TRACES_READ,
                permission::COSTS_READ_TEAM,
                permission::KEYS_READ,
                permission::KEYS_CREATE,
            ],
        ),
        builtin(
            "role_viewer",
            "viewer",
            "Read own traces and team costs",
            &[permission::TRACES_READ_OWN, permission::COSTS_READ_TEAM],
        ),
        builtin(
            "role_billing",
            "billing",
            "Read and export costs",
            &[permission::COSTS_READ, permission::COSTS_EXPORT],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_assignment_applies_to_any_scope() {
        let s = Scope::Global;
        assert!(s.applies_to(None));
        assert!(s.applies_to(Some(&Scope::Org("acme".into()))));
        assert!(s.applies_to(Some(&Scope::Team("platform".into()))));
    }

    #[test]
    fn scoped_assignment_requires_exact_match() {
        let s = Scope::Team("platform".into());
        assert!(s.applies_to(None));
        assert!(s.applies_to(Some(&Scope::Team("platform".into()))));
        assert!(!s.applies_to(Some(&Scope::Team("data".into()))));
        assert!(!s.applies_to(Some(&Scope::Org("platform".into()))));
        assert!(!Scope::Org("acme".into()).applies_to(Some(&Scope::Global)));
    }

    #[test]
    fn scope_serde_shape() {
        let json = serde_json::to_value(Scope::Team("platform".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "team", "id": "platform"}));
        let s: Scope = serde_json::from_value(serde_json::json!({"type": "global"})).unwrap();
        assert_eq!(s, Scope::Global);
    }

    #[test]
    fn builtins_are_global_and_immutable() {
        let roles = builtin_roles();
        assert_eq!(roles.len(), 4);
        assert!(roles.iter().all(|r| r.is_builtin && r.org_id.is_none()));
        assert!(roles.iter().all(|r| r.visible_to("any-org")));
        let admin = &roles[0];
        assert_eq!(admin.granting("keys:rotate"), Some("*"));
    }

    #[test]
    fn developer_cannot_administer() {
        let dev = builtin_roles().into_iter().find(|r| r.name == "developer").unwrap();
        assert!(dev.granting(permission::MCP_CALL).is_some());
        assert!(dev.granting(permission::RBAC_ADMIN).is_none());
    }
}
