//! Role and assignment storage.
//!
//! [`RbacStore`] is the CRUD contract the engine depends on. The in-memory
//! implementation keeps everything behind one `RwLock`: permission checks take
//! the read side concurrently, role and assignment changes take the write side.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::role::{Role, RoleAssignment};
use crate::Result;

/// Storage backend for roles and assignments.
#[async_trait]
pub trait RbacStore: Send + Sync + 'static {
    /// Role by id
    async fn get_role(&self, id: &str) -> Result<Option<Role>>;

    /// Role by name within an organization (`None` = built-ins)
    async fn find_role_by_name(&self, org_id: Option<&str>, name: &str) -> Result<Option<Role>>;

    /// Built-in roles plus the roles of `org_id`, built-ins first then by name
    async fn list_roles(&self, org_id: &str) -> Result<Vec<Role>>;

    /// Insert or replace a role
    async fn upsert_role(&self, role: Role) -> Result<()>;

    /// Delete a role and every assignment of it. Returns the removed role.
    async fn delete_role(&self, id: &str) -> Result<Option<Role>>;

    /// Assignments held by `user_id` within `org_id`
    async fn assignments_for_user(&self, org_id: &str, user_id: &str) -> Result<Vec<RoleAssignment>>;

    /// Assignments of `role_id`
    async fn assignments_for_role(&self, role_id: &str) -> Result<Vec<RoleAssignment>>;

    /// Insert an assignment
    async fn insert_assignment(&self, assignment: RoleAssignment) -> Result<()>;

    /// Remove assignment `id` if it belongs to `org_id`. Returns the removed
    /// assignment.
    async fn delete_assignment(&self, org_id: &str, id: &str) -> Result<Option<RoleAssignment>>;
}

#[derive(Default)]
struct Tables {
    roles: HashMap<String, Role>,
    assignments: HashMap<String, RoleAssignment>,
}

/// In-memory RBAC store
#[derive(Default)]
pub struct InMemoryRbacStore {
    tables: RwLock<Tables>,
}

impl InMemoryRbacStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RbacStore for InMemoryRbacStore {
    async fn get_role(&self, id: &str) -> Result<Option<Role>> {
        Ok(self.tables.read().roles.get(id).cloned())
    }

    async fn find_role_by_name(&self, org_id: Option<&str>, name: &str) -> Result<Option<Role>> {
        Ok(self
            .tables
            .read()
            .roles
            .values()
            .find(|r| r.org_id.as_deref() == org_id && r.name == name)
            .cloned())
    }

    async fn list_roles(&self, org_id: &str) -> Result<Vec<Role>> {
        let mut roles: Vec<Role> = self
            .tables
            .read()
            .roles
            .values()
            .filter(|r| r.visible_to(org_id))
            .cloned()
            .collect();
        roles.sort_by(|a, b| b.is_builtin.cmp(&a.is_builtin).then_with(|| a.name.cmp(&b.name)));
        Ok(roles)
    }

    async fn upsert_role(&self, role: Role) -> Result<()> {
        self.tables.write().roles.insert(role.id.clone(), role);
        Ok(())
    }

    async fn delete_role(&self, id: &str) -> Result<Option<Role>> {
        let mut tables = self.tables.write();
        let removed = tables.roles.remove(id);
        if removed.is_some() {
            tables.assignments.retain(|_, a| a.role_id != id);
        }
        Ok(removed)
    }

    async fn assignments_for_user(&self, org_id: &str, user_id: &str) -> Result<Vec<RoleAssignment>> {
        Ok(self
            .tables
            .read()
            .assignments
            .values()
            .filter(|a| a.org_id == org_id && a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn assignments_for_role(&self, role_id: &str) -> Result<Vec<RoleAssignment>> {
        Ok(self
            .tables
            .read()
            .assignments
            .values()
            .filter(|a| a.role_id == role_id)
            .cloned()
            .collect())
    }

    async fn insert_assignment(&self, assignment: RoleAssignment) -> Result<()> {
        self.tables
            .write()
            .assignments
            .insert(assignment.id.clone(), assignment);
        Ok(())
    }

    async fn delete_assignment(&self, org_id: &str, id: &str) -> Result<Option<RoleAssignment>> {
        let mut tables = self.tables.write();
        if tables.assignments.get(id).is_none_or(|a| a.org_id != org_id) {
            return Ok(None);
        }
        Ok(tables.assignments.remove(id))
    }
}
