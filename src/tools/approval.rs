//! Approval requests and their state machine.
//!
//! ```text
//! pending --approve--> approved --expires_at passes--> expired
//!    \----deny-----> denied
//! ```
//!
//! Only `pending` may be reviewed. An approved request past its expiry is
//! inactive immediately; the stored `expired` status is written later by the
//! sweep and is informational.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Approval request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Awaiting review
    Pending,
    /// Granted
    Approved,
    /// Refused
    Denied,
    /// Granted, then lapsed
    Expired,
}

impl ApprovalStatus {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }
}

/// A request to use one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolApproval {
    /// Approval id
    pub id: String,
    /// Organization
    pub org_id: String,
    /// Team of the requester
    pub team_id: Option<String>,
    /// MCP server
    pub server: String,
    /// Tool
    pub tool: String,
    /// Requesting subject
    pub requested_by: String,
    /// Request time
    pub requested_at: DateTime<Utc>,
    /// Justification
    pub reason: String,
    /// Arguments snapshot for the reviewer
    pub arguments: Option<Value>,
    /// Status
    pub status: ApprovalStatus,
    /// Reviewer
    pub reviewed_by: Option<String>,
    /// Review time
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Reviewer's note
    pub review_note: String,
    /// End of the approval's validity
    pub expires_at: Option<DateTime<Utc>>,
    /// Trace id of the request that prompted it
    pub trace_id: Option<String>,
}

/// Review decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Grant
    Approve,
    /// Refuse
    Deny,
}

impl ToolApproval {
    /// Whether this approval currently admits calls
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Approved && self.expires_at.is_none_or(|exp| exp > now)
    }

    /// Whether the sweep should mark this approval expired
    #[must_use]
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Approved && self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Apply a review. Fails unless the request is pending.
    pub fn review(
        &mut self,
        decision: Decision,
        reviewer: &str,
        note: String,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != ApprovalStatus::Pending {
            return Err(not_pending(self.status));
        }
        self.status = match decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Deny => ApprovalStatus::Denied,
        };
        self.reviewed_by = Some(reviewer.to_string());
        self.reviewed_at = Some(now);
        self.review_note = note;
        self.expires_at = match decision {
            Decision::Approve => expires_at,
            Decision::Deny => None,
        };
        Ok(())
    }
}

/// Error for reviewing a request that is no longer pending
pub(crate) fn not_pending(status: ApprovalStatus) -> Error {
    Error::Validation(format!(
        "Approval request is not pending (status: {})",
        status.as_str()
    ))
}

/// Payload for a new approval request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// MCP server
    pub server: String,
    /// Tool
    pub tool: String,
    /// Team of the requester (defaults to the principal's)
    #[serde(default)]
    pub team_id: Option<String>,
    /// Justification
    #[serde(default)]
    pub reason: String,
    /// Arguments snapshot
    #[serde(default)]
    pub arguments: Option<Value>,
    /// Trace id
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Payload for approve/deny
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewInput {
    /// Reviewer's note
    pub note: String,
    /// Validity in seconds from review time (approve only)
    pub expires_in: Option<i64>,
}

/// Approval query filter
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApprovalFilter {
    /// Organization (set from the principal)
    #[serde(skip)]
    pub org_id: String,
    /// Team
    pub team_id: Option<String>,
    /// MCP server
    pub server: Option<String>,
    /// Tool
    pub tool: Option<String>,
    /// Requester
    pub requested_by: Option<String>,
    /// Statuses
    #[serde(deserialize_with = "crate::config::comma_list::deserialize")]
    pub statuses: Vec<ApprovalStatus>,
    /// Page size (default 50)
    pub limit: Option<usize>,
    /// Page offset
    pub offset: Option<usize>,
}

impl ApprovalFilter {
    /// Whether `a` passes the filter
    #[must_use]
    pub fn matches(&self, a: &ToolApproval) -> bool {
        a.org_id == self.org_id
            && self.team_id.as_ref().is_none_or(|t| a.team_id.as_ref() == Some(t))
            && self.server.as_ref().is_none_or(|s| &a.server == s)
            && self.tool.as_ref().is_none_or(|t| &a.tool == t)
            && self.requested_by.as_ref().is_none_or(|r| &a.requested_by == r)
            && (self.statuses.is_empty() || self.statuses.contains(&a.status))
    }
}

/// One page of approvals, newest first
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalPage {
    /// Approvals
    pub approvals: Vec<ToolApproval>,
    /// Matches before paging
    pub total: usize,
    /// Page size
    pub limit: usize,
    /// Page offset
    pub offset: usize,
    /// Whether more pages follow
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    pub(super) fn pending() -> ToolApproval {
        ToolApproval {
            id: "apr_1".to_string(),
            org_id: "acme".to_string(),
            team_id: None,
            server: "db".to_string(),
            tool: "execute_sql".to_string(),
            requested_by: "alice".to_string(),
            requested_at: Utc::now(),
            reason: "migration".to_string(),
            arguments: None,
            status: ApprovalStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_note: String::new(),
            expires_at: None,
            trace_id: None,
        }
    }

    #[test]
    fn only_pending_can_be_reviewed() {
        let now = Utc::now();
        let mut a = pending();
        a.review(Decision::Approve, "bob", "ok".into(), None, now).unwrap();
        assert_eq!(a.status, ApprovalStatus::Approved);

        // Terminal states never revert
        assert!(a.review(Decision::Deny, "bob", String::new(), None, now).is_err());
        assert_eq!(a.status, ApprovalStatus::Approved);

        let mut d = pending();
        d.review(Decision::Deny, "bob", "no".into(), Some(now), now).unwrap();
        assert_eq!(d.status, ApprovalStatus::Denied);
        assert!(d.expires_at.is_none());
        assert!(d.review(Decision::Approve, "bob", String::new(), None, now).is_err());
    }

    #[test]
    fn approved_past_expiry_is_inactive_before_sweep() {
        // GIVEN: an approval that expired a second ago, status still approved
        let now = Utc::now();
        let mut a = pending();
        a.review(Decision::Approve, "bob", String::new(), Some(now - Duration::seconds(1)), now)
            .unwrap();

        // THEN: it is inactive and due for the sweep
        assert_eq!(a.status, ApprovalStatus::Approved);
        assert!(!a.is_active(now));
        assert!(a.is_lapsed(now));
    }

    #[test]
    fn approval_without_expiry_never_lapses() {
        let now = Utc::now();
        let mut a = pending();
        a.review(Decision::Approve, "bob", String::new(), None, now).unwrap();
        assert!(a.is_active(now + Duration::days(3650)));
        assert!(!a.is_lapsed(now + Duration::days(3650)));
    }

    #[test]
    fn filter_matches_on_every_field() {
        let a = pending();
        let mut f = ApprovalFilter {
            org_id: "acme".into(),
            ..Default::default()
        };
        assert!(f.matches(&a));
        f.statuses = vec![ApprovalStatus::Approved];
        assert!(!f.matches(&a));
        f.statuses = vec![ApprovalStatus::Pending];
        f.requested_by = Some("carol".into());
        assert!(!f.matches(&a));
    }
}
