//! Permission resolution over role assignments.

use std::sync::Arc;

use chrono::Utc;
use gateway_core::permission;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::role::{Role, RoleAssignment, RoleInput, Scope, builtin_roles};
use super::store::RbacStore;
use crate::config::RbacConfig;
use crate::identity::{PermissionSource, Principal};
use crate::{Error, Result};

/// Structured permission check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheck {
    /// Whether the permission is held
    pub allowed: bool,
    /// Permission that was asked for
    pub permission: String,
    /// Name of the role that granted it
    pub granted_by: Option<String>,
    /// Permission string that matched
    pub matched: Option<String>,
}

impl PermissionCheck {
    fn denied(permission: &str) -> Self {
        Self {
            allowed: false,
            permission: permission.to_string(),
            granted_by: None,
            matched: None,
        }
    }
}

/// Resolves permissions from role assignments and manages roles.
pub struct PermissionEngine {
    store: Arc<dyn RbacStore>,
}

impl PermissionEngine {
    /// Create an engine over `store`
    pub fn new(store: Arc<dyn RbacStore>) -> Self {
        Self { store }
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RbacStore> {
        &self.store
    }

    /// Insert the built-in roles (idempotent)
    pub async fn seed_builtins(&self) -> Result<()> {
        for role in builtin_roles() {
            if self.store.get_role(&role.id).await?.is_none() {
                self.store.upsert_role(role).await?;
            }
        }
        Ok(())
    }

    /// Whether `user_id` of `org_id` holds `required` at `scope`.
    ///
    /// Users without assignments simply do not hold anything.
    pub async fn has_permission(
        &self,
        org_id: &str,
        user_id: &str,
        required: &str,
        scope: Option<&Scope>,
    ) -> Result<bool> {
        Ok(self.check_permission(org_id, user_id, required, scope).await?.allowed)
    }

    /// Like [`has_permission`](Self::has_permission) but names the granting role
    pub async fn check_permission(
        &self,
        org_id: &str,
        user_id: &str,
        required: &str,
        scope: Option<&Scope>,
    ) -> Result<PermissionCheck> {
        for (assignment, role) in self.assigned_roles(org_id, user_id).await? {
            if !assignment.scope.applies_to(scope) {
                continue;
            }
            if let Some(matched) = role.granting(required) {
                return Ok(PermissionCheck {
                    allowed: true,
                    permission: required.to_string(),
                    granted_by: Some(role.name.clone()),
                    matched: Some(matched.to_string()),
                });
            }
        }
        Ok(PermissionCheck::denied(required))
    }

    /// De-duplicated, sorted union of the user's permissions in `org_id` at
    /// `scope`
    pub async fn user_permissions(
        &self,
        org_id: &str,
        user_id: &str,
        scope: Option<&Scope>,
    ) -> Result<Vec<String>> {
        let mut perms: Vec<String> = self
            .assigned_roles(org_id, user_id)
            .await?
            .into_iter()
            .filter(|(a, _)| a.scope.applies_to(scope))
            .flat_map(|(_, r)| r.permissions)
            .collect();
        perms.sort();
        perms.dedup();
        Ok(perms)
    }

    /// Whether a request principal holds `required`.
    ///
    /// Key principals use their flat list. Session principals are checked
    /// against their organization scope, then their team scope.
    pub async fn principal_has(&self, principal: &Principal, required: &str) -> Result<bool> {
        match &principal.permissions {
            PermissionSource::Flat(list) => Ok(permission::grants_any(list, required)),
            PermissionSource::Roles => {
                let Some(user) = principal.user_id.as_deref() else {
                    return Ok(false);
                };
                let org_id = principal.org_id.as_str();
                let org = Scope::Org(org_id.to_string());
                if self.has_permission(org_id, user, required, Some(&org)).await? {
                    return Ok(true);
                }
                match &principal.team_id {
                    Some(team) => {
                        let team = Scope::Team(team.clone());
                        self.has_permission(org_id, user, required, Some(&team)).await
                    }
                    None => Ok(false),
                }
            }
        }
    }

    /// Fail with 403 unless `principal` holds `required`
    pub async fn require(&self, principal: &Principal, required: &str) -> Result<()> {
        if self.principal_has(principal, required).await? {
            Ok(())
        } else {
            debug!(subject = %principal.subject(), permission = %required, "Permission denied");
            Err(Error::Forbidden(format!("Missing permission '{required}'")))
        }
    }

    async fn assigned_roles(&self, org_id: &str, user_id: &str) -> Result<Vec<(RoleAssignment, Role)>> {
        let mut out = Vec::new();
        for assignment in self.store.assignments_for_user(org_id, user_id).await? {
            if let Some(role) = self.store.get_role(&assignment.role_id).await? {
                out.push((assignment, role));
            }
        }
        Ok(out)
    }

    // ── Role management ──

    /// Roles visible to `org_id`
    pub async fn list_roles(&self, org_id: &str) -> Result<Vec<Role>> {
        self.store.list_roles(org_id).await
    }

    /// Role by id, if visible to `org_id`
    pub async fn get_role(&self, org_id: &str, id: &str) -> Result<Role> {
        match self.store.get_role(id).await? {
            Some(role) if role.visible_to(org_id) => Ok(role),
            _ => Err(Error::NotFound(format!("Role '{id}' not found"))),
        }
    }

    /// Create a custom role in `org_id`
    pub async fn create_role(&self, org_id: &str, input: RoleInput) -> Result<Role> {
        validate_input(&input)?;
        if self.name_taken(org_id, &input.name, None).await? {
            return Err(Error::Validation(format!(
                "A role named '{}' already exists",
                input.name
            )));
        }
        let now = Utc::now();
        let role = Role {
            id: format!("role_{}", uuid::Uuid::new_v4().simple()),
            org_id: Some(org_id.to_string()),
            name: input.name,
            description: input.description,
            permissions: input.permissions,
            is_builtin: false,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_role(role.clone()).await?;
        info!(role = %role.name, org = %org_id, "Role created");
        Ok(role)
    }

    /// Replace name, description and permissions of a custom role
    pub async fn update_role(&self, org_id: &str, id: &str, input: RoleInput) -> Result<Role> {
        let mut role = self.custom_role(org_id, id).await?;
        validate_input(&input)?;
        if self.name_taken(org_id, &input.name, Some(id)).await? {
            return Err(Error::Validation(format!(
                "A role named '{}' already exists",
                input.name
            )));
        }
        role.name = input.name;
        role.description = input.description;
        role.permissions = input.permissions;
        role.updated_at = Utc::now();
        self.store.upsert_role(role.clone()).await?;
        info!(role = %role.name, org = %org_id, "Role updated");
        Ok(role)
    }

    /// Delete a custom role and its assignments
    pub async fn delete_role(&self, org_id: &str, id: &str) -> Result<Role> {
        let role = self.custom_role(org_id, id).await?;
        self.store.delete_role(id).await?;
        info!(role = %role.name, org = %org_id, "Role deleted");
        Ok(role)
    }

    async fn custom_role(&self, org_id: &str, id: &str) -> Result<Role> {
        let role = self.get_role(org_id, id).await?;
        if role.is_builtin {
            return Err(Error::Validation(format!(
                "Built-in role '{}' cannot be modified",
                role.name
            )));
        }
        Ok(role)
    }

    async fn name_taken(&self, org_id: &str, name: &str, except: Option<&str>) -> Result<bool> {
        for owner in [Some(org_id), None] {
            if let Some(existing) = self.store.find_role_by_name(owner, name).await? {
                if Some(existing.id.as_str()) != except {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // ── Assignments ──

    /// Assign a role on behalf of `principal`, within the principal's
    /// organization.
    ///
    /// An `org` scope must name that organization. A `global` scope needs a
    /// principal holding `*`.
    pub async fn assign_for(
        &self,
        principal: &Principal,
        user_id: &str,
        role_id: &str,
        scope: Scope,
    ) -> Result<RoleAssignment> {
        match &scope {
            Scope::Org(org) if *org != principal.org_id => {
                warn!(subject = %principal.subject(), scope = %scope, "Cross-organization role assignment refused");
                return Err(Error::Forbidden(
                    "Roles can only be assigned within your organization".to_string(),
                ));
            }
            Scope::Global if !self.principal_has(principal, permission::ALL).await? => {
                return Err(Error::Forbidden(format!(
                    "Assigning a global role requires '{}'",
                    permission::ALL
                )));
            }
            _ => {}
        }
        self.assign_role(&principal.org_id, user_id, role_id, scope, Some(principal.subject()))
            .await
    }

    /// Assign a role to a user of `org_id`. Re-assigning the same role at the
    /// same scope returns the existing assignment.
    pub async fn assign_role(
        &self,
        org_id: &str,
        user_id: &str,
        role_id: &str,
        scope: Scope,
        granted_by: Option<&str>,
    ) -> Result<RoleAssignment> {
        if user_id.trim().is_empty() {
            return Err(Error::Validation("user_id is required".to_string()));
        }
        let role = self.get_role(org_id, role_id).await?;
        if let Some(existing) = self
            .store
            .assignments_for_user(org_id, user_id)
            .await?
            .into_iter()
            .find(|a| a.role_id == role.id && a.scope == scope)
        {
            return Ok(existing);
        }
        let assignment = RoleAssignment {
            id: format!("asg_{}", uuid::Uuid::new_v4().simple()),
            org_id: org_id.to_string(),
            user_id: user_id.to_string(),
            role_id: role.id,
            scope,
            granted_by: granted_by.map(ToString::to_string),
            created_at: Utc::now(),
        };
        self.store.insert_assignment(assignment.clone()).await?;
        info!(org = %org_id, user = %user_id, role = %role.name, scope = %assignment.scope, "Role assigned");
        Ok(assignment)
    }

    /// Remove an assignment of `org_id`
    pub async fn revoke_assignment(&self, org_id: &str, id: &str) -> Result<RoleAssignment> {
        let removed = self
            .store
            .delete_assignment(org_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Role assignment '{id}' not found")))?;
        info!(user = %removed.user_id, role = %removed.role_id, "Role assignment revoked");
        Ok(removed)
    }

    /// Create configured roles and assignments
    pub async fn seed(&self, cfg: &RbacConfig) -> Result<()> {
        for seed in &cfg.roles {
            self.create_role(
                &seed.org_id,
                RoleInput {
                    name: seed.name.clone(),
                    description: seed.description.clone(),
                    permissions: seed.permissions.clone(),
                },
            )
            .await
            .map_err(|e| Error::Config(format!("role '{}': {e}", seed.name)))?;
        }
        for seed in &cfg.assignments {
            let role = match self.store.find_role_by_name(Some(&seed.org_id), &seed.role).await? {
                Some(role) => role,
                None => self
                    .store
                    .find_role_by_name(None, &seed.role)
                    .await?
                    .ok_or_else(|| Error::Config(format!("unknown role '{}'", seed.role)))?,
            };
            self.assign_role(&seed.org_id, &seed.user_id, &role.id, seed.scope.clone(), None)
                .await?;
        }
        Ok(())
    }
}

fn validate_input(input: &RoleInput) -> Result<()> {
    if input.name.trim().is_empty() {
        return Err(Error::Validation("name is required".to_string()));
    }
    if input.permissions.is_empty() {
        return Err(Error::Validation("permissions must not be empty".to_string()));
    }
    if let Some(bad) = input.permissions.iter().find(|p| !permission::is_valid(p)) {
        return Err(Error::Validation(format!("unknown permission '{bad}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AuthMethod;
    use crate::rbac::InMemoryRbacStore;

    async fn engine() -> PermissionEngine {
        let engine = PermissionEngine::new(Arc::new(InMemoryRbacStore::new()));
        engine.seed_builtins().await.unwrap();
        engine
    }

    fn input(name: &str, perms: &[&str]) -> RoleInput {
        RoleInput {
            name: name.to_string(),
            description: String::new(),
            permissions: perms.iter().map(ToString::to_string).collect(),
        }
    }

    fn session_principal(user: &str, team: Option<&str>) -> Principal {
        Principal {
            org_id: "acme".to_string(),
            user_id: Some(user.to_string()),
            key_id: None,
            team_id: team.map(ToString::to_string),
            permissions: PermissionSource::Roles,
            rate_limit: 0,
            method: AuthMethod::Session {
                session_id: "s".to_string(),
            },
        }
    }

    // ── Resolution ──

    #[tokio::test]
    async fn wildcard_prefix_grants_whole_namespace() {
        // GIVEN: a role granting mcp:*
        let engine = engine().await;
        let role = engine.create_role("acme", input("mcp-all", &["mcp:*"])).await.unwrap();
        engine.assign_role("acme", "alice", &role.id, Scope::Global, None).await.unwrap();

        // THEN: every mcp permission is held, nothing else is
        for p in ["mcp:read", "mcp:write", "mcp:call"] {
            assert!(engine.has_permission("acme", "alice", p, None).await.unwrap(), "{p}");
        }
        assert!(!engine.has_permission("acme", "alice", "keys:read", None).await.unwrap());
        assert!(!engine.has_permission("acme", "alice", "mcpx:read", None).await.unwrap());
    }

    #[tokio::test]
    async fn no_assignments_means_false_not_error() {
        let engine = engine().await;
        assert!(!engine.has_permission("acme", "nobody", "mcp:read", None).await.unwrap());
        assert!(engine.user_permissions("acme", "nobody", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scoped_assignment_applies_only_on_exact_scope() {
        // GIVEN: developer at team:platform
        let engine = engine().await;
        engine
            .assign_role("acme", "bob", "role_developer", Scope::Team("platform".into()), None)
            .await
            .unwrap();

        // THEN: it applies at team:platform but not team:data or org:acme
        let platform = Scope::Team("platform".into());
        let data = Scope::Team("data".into());
        let org = Scope::Org("acme".into());
        assert!(engine.has_permission("acme", "bob", "mcp:call", Some(&platform)).await.unwrap());
        assert!(!engine.has_permission("acme", "bob", "mcp:call", Some(&data)).await.unwrap());
        assert!(!engine.has_permission("acme", "bob", "mcp:call", Some(&org)).await.unwrap());
    }

    #[tokio::test]
    async fn check_permission_names_granting_role() {
        let engine = engine().await;
        engine.assign_role("acme", "root", "role_admin", Scope::Global, None).await.unwrap();
        let check = engine.check_permission("acme", "root", "rbac:admin", None).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.granted_by.as_deref(), Some("admin"));
        assert_eq!(check.matched.as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn user_permissions_are_deduplicated() {
        let engine = engine().await;
        engine.assign_role("acme", "carol", "role_viewer", Scope::Global, None).await.unwrap();
        engine.assign_role("acme", "carol", "role_developer", Scope::Global, None).await.unwrap();
        let perms = engine.user_permissions("acme", "carol", None).await.unwrap();
        assert_eq!(perms.iter().filter(|p| *p == "costs:read:team").count(), 1);
        assert!(perms.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn session_principal_checked_at_org_then_team() {
        let engine = engine().await;
        engine
            .assign_role("acme", "dave", "role_developer", Scope::Team("platform".into()), None)
            .await
            .unwrap();

        assert!(engine.principal_has(&session_principal("dave", Some("platform")), "mcp:call").await.unwrap());
        assert!(!engine.principal_has(&session_principal("dave", None), "mcp:call").await.unwrap());
        let err = engine.require(&session_principal("dave", None), "mcp:call").await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    // ── Management ──

    #[tokio::test]
    async fn builtins_cannot_be_changed() {
        let engine = engine().await;
        let err = engine.delete_role("acme", "role_admin").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = engine
            .update_role("acme", "role_viewer", input("viewer", &["*"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn role_names_are_unique_and_permissions_validated() {
        let engine = engine().await;
        engine.create_role("acme", input("ops", &["mcp:read"])).await.unwrap();
        assert!(engine.create_role("acme", input("ops", &["mcp:read"])).await.is_err());
        assert!(engine.create_role("acme", input("admin", &["mcp:read"])).await.is_err());
        assert!(engine.create_role("acme", input("empty", &[])).await.is_err());
        assert!(engine.create_role("acme", input("bad", &["nope"])).await.is_err());
        // Same name in another org is fine
        assert!(engine.create_role("globex", input("ops", &["mcp:read"])).await.is_ok());
    }

    #[tokio::test]
    async fn assign_is_idempotent_and_delete_cascades() {
        // GIVEN: a custom role assigned twice at the same scope
        let engine = engine().await;
        let role = engine.create_role("acme", input("ops", &["mcp:read"])).await.unwrap();
        let a = engine.assign_role("acme", "erin", &role.id, Scope::Global, None).await.unwrap();
        let b = engine.assign_role("acme", "erin", &role.id, Scope::Global, None).await.unwrap();
        assert_eq!(a.id, b.id);

        // WHEN: the role is deleted
        engine.delete_role("acme", &role.id).await.unwrap();

        // THEN: the permission is gone
        assert!(!engine.has_permission("acme", "erin", "mcp:read", None).await.unwrap());
    }

    // ── Organization isolation ──

    fn key_principal(org: &str, perms: &[&str]) -> Principal {
        Principal {
            org_id: org.to_string(),
            user_id: Some(format!("{org}-admin")),
            key_id: Some(format!("key_{org}")),
            team_id: None,
            permissions: PermissionSource::Flat(perms.iter().map(ToString::to_string).collect()),
            rate_limit: 0,
            method: AuthMethod::ApiKey {
                environment: gateway_core::KeyEnvironment::Prd,
            },
        }
    }

    #[tokio::test]
    async fn assignments_never_apply_in_another_org() {
        // GIVEN: globex makes bob a global admin
        let engine = engine().await;
        let globex = key_principal("globex", &["*"]);
        engine.assign_for(&globex, "bob", "role_admin", Scope::Global).await.unwrap();

        // THEN: bob is an admin in globex only
        let acme = Scope::Org("acme".into());
        assert!(engine.has_permission("globex", "bob", "rbac:admin", None).await.unwrap());
        assert!(!engine.has_permission("acme", "bob", "rbac:admin", Some(&acme)).await.unwrap());
        assert!(engine.user_permissions("acme", "bob", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_org_scope_is_refused() {
        let engine = engine().await;
        let globex = key_principal("globex", &["*"]);

        let err = engine
            .assign_for(&globex, "carol", "role_admin", Scope::Org("acme".into()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Forbidden(_)));
        assert!(engine.user_permissions("acme", "carol", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn global_scope_needs_full_admin() {
        let engine = engine().await;
        let rbac_admin = key_principal("acme", &["rbac:admin"]);

        let err = engine
            .assign_for(&rbac_admin, "erin", "role_viewer", Scope::Global)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        // Org-wide assignment of the own org is fine
        let a = engine
            .assign_for(&rbac_admin, "erin", "role_viewer", Scope::Org("acme".into()))
            .await
            .unwrap();
        assert_eq!(a.org_id, "acme");
        assert_eq!(a.granted_by.as_deref(), Some("acme-admin"));
    }

    #[tokio::test]
    async fn revoke_is_confined_to_the_owning_org() {
        let engine = engine().await;
        let a = engine
            .assign_role("acme", "dave", "role_developer", Scope::Org("acme".into()), None)
            .await
            .unwrap();

        let err = engine.revoke_assignment("globex", &a.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(engine.has_permission("acme", "dave", "mcp:call", None).await.unwrap());

        engine.revoke_assignment("acme", &a.id).await.unwrap();
        assert!(!engine.has_permission("acme", "dave", "mcp:call", None).await.unwrap());
    }

    #[tokio::test]
    async fn other_orgs_roles_are_invisible() {
        let engine = engine().await;
        let role = engine.create_role("acme", input("ops", &["mcp:read"])).await.unwrap();
        assert!(matches!(engine.get_role("globex", &role.id).await, Err(Error::NotFound(_))));
        assert!(engine.assign_role("globex", "x", &role.id, Scope::Global, None).await.is_err());
    }
}
