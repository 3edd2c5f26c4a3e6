//! Tool access storage.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;

use super::approval::{ApprovalStatus, ToolApproval};
use super::classification::ToolClassification;
use super::grant::ToolPermission;
use crate::Result;

/// Approvals kept in memory; the oldest is dropped first
pub const MAX_APPROVALS: usize = 1000;

/// Outcome of a guarded approval write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The new state was stored
    Applied,
    /// The stored status was no longer the expected one
    Conflict(ApprovalStatus),
    /// No approval with that id
    Missing,
}

/// Storage backend for classifications, approvals, grants and grant usage.
#[async_trait]
pub trait ToolStore: Send + Sync + 'static {
    /// Classification of `(org, server, tool)`
    async fn get_classification(&self, org_id: &str, server: &str, tool: &str) -> Result<Option<ToolClassification>>;

    /// Insert or replace a classification
    async fn upsert_classification(&self, classification: ToolClassification) -> Result<()>;

    /// Classifications of `org_id`, optionally for one server
    async fn list_classifications(&self, org_id: &str, server: Option<&str>) -> Result<Vec<ToolClassification>>;

    /// Delete a classification. Returns `false` if it did not exist.
    async fn delete_classification(&self, org_id: &str, server: &str, tool: &str) -> Result<bool>;

    /// Append an approval request
    async fn insert_approval(&self, approval: ToolApproval) -> Result<()>;

    /// Approval by id
    async fn get_approval(&self, id: &str) -> Result<Option<ToolApproval>>;

    /// Replace an approval only while its stored status is still `expected`.
    ///
    /// The status check and the write are one atomic step.
    async fn transition_approval(&self, expected: ApprovalStatus, approval: ToolApproval) -> Result<Transition>;

    /// All approvals in creation order
    async fn list_approvals(&self) -> Result<Vec<ToolApproval>>;

    /// Approvals for one subject and tool
    async fn approvals_for(&self, org_id: &str, requested_by: &str, server: &str, tool: &str) -> Result<Vec<ToolApproval>>;

    /// Add a grant
    async fn insert_permission(&self, permission: ToolPermission) -> Result<()>;

    /// Grant by id
    async fn get_permission(&self, id: &str) -> Result<Option<ToolPermission>>;

    /// Delete a grant. Returns `false` if it did not exist.
    async fn delete_permission(&self, id: &str) -> Result<bool>;

    /// Grants of `org_id`, optionally for one server
    async fn list_permissions(&self, org_id: &str, server: Option<&str>) -> Result<Vec<ToolPermission>>;

    /// Count one use of grant `id` on `day` unless the count already reached
    /// `max`. Returns whether the use was admitted.
    async fn consume_use(&self, id: &str, day: NaiveDate, max: u32) -> Result<bool>;

    /// Uses of grant `id` on `day`
    async fn uses(&self, id: &str, day: NaiveDate) -> Result<u32>;
}

type ClassificationKey = (String, String, String);

#[derive(Default)]
struct Tables {
    classifications: HashMap<ClassificationKey, ToolClassification>,
    approvals: VecDeque<ToolApproval>,
    permissions: HashMap<String, ToolPermission>,
    usage: HashMap<(String, NaiveDate), u32>,
}

/// In-memory tool store behind one read/write lock
#[derive(Default)]
pub struct InMemoryToolStore {
    tables: RwLock<Tables>,
}

impl InMemoryToolStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(org_id: &str, server: &str, tool: &str) -> ClassificationKey {
    (org_id.to_string(), server.to_string(), tool.to_string())
}

#[async_trait]
impl ToolStore for InMemoryToolStore {
    async fn get_classification(&self, org_id: &str, server: &str, tool: &str) -> Result<Option<ToolClassification>> {
        Ok(self.tables.read().classifications.get(&key(org_id, server, tool)).cloned())
    }

    async fn upsert_classification(&self, c: ToolClassification) -> Result<()> {
        self.tables
            .write()
            .classifications
            .insert(key(&c.org_id, &c.server, &c.tool), c);
        Ok(())
    }

    async fn list_classifications(&self, org_id: &str, server: Option<&str>) -> Result<Vec<ToolClassification>> {
        let mut out: Vec<ToolClassification> = self
            .tables
            .read()
            .classifications
            .values()
            .filter(|c| c.org_id == org_id && server.is_none_or(|s| c.server == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.server, &a.tool).cmp(&(&b.server, &b.tool)));
        Ok(out)
    }

    async fn delete_classification(&self, org_id: &str, server: &str, tool: &str) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .classifications
            .remove(&key(org_id, server, tool))
            .is_some())
    }

    async fn insert_approval(&self, approval: ToolApproval) -> Result<()> {
        let mut tables = self.tables.write();
        while tables.approvals.len() >= MAX_APPROVALS {
            tables.approvals.pop_front();
        }
        tables.approvals.push_back(approval);
        Ok(())
    }

    async fn get_approval(&self, id: &str) -> Result<Option<ToolApproval>> {
        Ok(self.tables.read().approvals.iter().find(|a| a.id == id).cloned())
    }

    async fn transition_approval(&self, expected: ApprovalStatus, approval: ToolApproval) -> Result<Transition> {
        let mut tables = self.tables.write();
        let Some(slot) = tables.approvals.iter_mut().find(|a| a.id == approval.id) else {
            return Ok(Transition::Missing);
        };
        if slot.status != expected {
            return Ok(Transition::Conflict(slot.status));
        }
        *slot = approval;
        Ok(Transition::Applied)
    }

    async fn list_approvals(&self) -> Result<Vec<ToolApproval>> {
        Ok(self.tables.read().approvals.iter().cloned().collect())
    }

    async fn approvals_for(&self, org_id: &str, requested_by: &str, server: &str, tool: &str) -> Result<Vec<ToolApproval>> {
        Ok(self
            .tables
            .read()
            .approvals
            .iter()
            .filter(|a| {
                a.org_id == org_id && a.requested_by == requested_by && a.server == server && a.tool == tool
            })
            .cloned()
            .collect())
    }

    async fn insert_permission(&self, permission: ToolPermission) -> Result<()> {
        self.tables
            .write()
            .permissions
            .insert(permission.id.clone(), permission);
        Ok(())
    }

    async fn get_permission(&self, id: &str) -> Result<Option<ToolPermission>> {
        Ok(self.tables.read().permissions.get(id).cloned())
    }

    async fn delete_permission(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        let removed = tables.permissions.remove(id).is_some();
        if removed {
            tables.usage.retain(|(grant, _), _| grant != id);
        }
        Ok(removed)
    }

    async fn list_permissions(&self, org_id: &str, server: Option<&str>) -> Result<Vec<ToolPermission>> {
        let mut out: Vec<ToolPermission> = self
            .tables
            .read()
            .permissions
            .values()
            .filter(|p| p.org_id == org_id && server.is_none_or(|s| p.server == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.granted_at.cmp(&b.granted_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn consume_use(&self, id: &str, day: NaiveDate, max: u32) -> Result<bool> {
        let mut tables = self.tables.write();
        // Older days are no longer needed
        tables.usage.retain(|(_, d), _| *d >= day);
        let count = tables.usage.entry((id.to_string(), day)).or_insert(0);
        if *count >= max {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn uses(&self, id: &str, day: NaiveDate) -> Result<u32> {
        Ok(self
            .tables
            .read()
            .usage
            .get(&(id.to_string(), day))
            .copied()
            .unwrap_or(0))
    }
}
