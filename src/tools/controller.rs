//! Tool access decisions and administration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use super::approval::{
    ApprovalFilter, ApprovalPage, ApprovalRequest, ApprovalStatus, Decision, ReviewInput,
    ToolApproval, not_pending,
};
use super::classification::{ClassificationInput, EffectiveRisk, RiskLevel, ToolClassification};
use super::grant::{GrantInput, ToolPermission, applicable_grants};
use super::store::{ToolStore, Transition};
use crate::config::ToolsConfig;
use crate::{Error, Result};

/// Reason given when a dangerous tool is called without a grant
pub const DANGEROUS_REASON: &str =
    "This tool is classified as dangerous and requires explicit approval";
/// Reason given when a sensitive tool is called without grant or approval
pub const APPROVAL_REASON: &str = "This tool requires approval before use";
/// Reason given when every applicable grant has no uses left today
pub const DAILY_CAP_REASON: &str = "Daily usage limit reached for this tool";

/// What admitted a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AccessVia {
    /// Risk level alone
    Classification,
    /// A tool permission grant
    Grant(String),
    /// An approved request
    Approval(String),
}

/// Result of an access check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Denial reason (empty when allowed)
    pub reason: String,
    /// Effective risk level
    pub risk: RiskLevel,
    /// Effective approval requirement
    pub requires_approval: bool,
    /// What admitted the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<AccessVia>,
}

impl AccessDecision {
    fn allow(eff: EffectiveRisk, via: AccessVia) -> Self {
        Self {
            allowed: true,
            reason: String::new(),
            risk: eff.risk,
            requires_approval: eff.requires_approval,
            via: Some(via),
        }
    }

    fn deny(eff: EffectiveRisk, reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
            risk: eff.risk,
            requires_approval: eff.requires_approval,
            via: None,
        }
    }
}

/// Identity a tool call is checked for
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    /// Organization
    pub org_id: &'a str,
    /// User or key subject
    pub subject: Option<&'a str>,
    /// Team
    pub team_id: Option<&'a str>,
}

/// Gates tool calls by risk, grants and approvals.
pub struct ToolAccessController {
    store: Arc<dyn ToolStore>,
}

impl ToolAccessController {
    /// Create a controller over `store`
    pub fn new(store: Arc<dyn ToolStore>) -> Self {
        Self { store }
    }

    /// Effective classification of `(server, tool)` for `org_id`
    pub async fn classify(&self, org_id: &str, server: &str, tool: &str) -> Result<EffectiveRisk> {
        let stored = self.store.get_classification(org_id, server, tool).await?;
        Ok(EffectiveRisk::resolve(stored.as_ref(), tool))
    }

    /// Decide whether `caller` may call `tool` on `server`. Read-only: a
    /// capped grant counts only while it has uses left today.
    pub async fn check_access(&self, caller: Caller<'_>, server: &str, tool: &str) -> Result<AccessDecision> {
        self.decide(caller, server, tool, false).await
    }

    /// [`check_access`](Self::check_access) for a call about to be forwarded:
    /// a use is counted against the admitting grant's daily cap.
    ///
    /// A grant at its cap is passed over for the next applicable grant, then
    /// for an active approval.
    pub async fn admit(&self, caller: Caller<'_>, server: &str, tool: &str) -> Result<AccessDecision> {
        self.decide(caller, server, tool, true).await
    }

    async fn decide(&self, caller: Caller<'_>, server: &str, tool: &str, consume: bool) -> Result<AccessDecision> {
        let eff = self.classify(caller.org_id, server, tool).await?;
        let cleared_by_risk = match eff.risk {
            RiskLevel::Safe => true,
            RiskLevel::Sensitive => !eff.requires_approval,
            RiskLevel::Dangerous => false,
        };
        if cleared_by_risk {
            return Ok(AccessDecision::allow(eff, AccessVia::Classification));
        }

        let now = Utc::now();
        let grants = self.store.list_permissions(caller.org_id, Some(server)).await?;
        let mut capped = false;
        for grant in applicable_grants(&grants, caller.subject, caller.team_id, tool, now) {
            if self.has_capacity(grant, consume).await? {
                return Ok(AccessDecision::allow(eff, AccessVia::Grant(grant.id.clone())));
            }
            debug!(grant = %grant.id, tool = %tool, "Tool grant daily cap reached");
            capped = true;
        }

        if eff.risk == RiskLevel::Sensitive {
            if let Some(a) = self.find_approval(caller, server, tool).await? {
                return Ok(AccessDecision::allow(eff, AccessVia::Approval(a.id)));
            }
        }
        let reason = match eff.risk {
            _ if capped => DAILY_CAP_REASON,
            RiskLevel::Dangerous => DANGEROUS_REASON,
            _ => APPROVAL_REASON,
        };
        Ok(AccessDecision::deny(eff, reason))
    }

    /// Whether `grant` may admit one more call today; counts the use when
    /// `consume` is set
    async fn has_capacity(&self, grant: &ToolPermission, consume: bool) -> Result<bool> {
        let Some(max) = grant.max_uses_per_day else {
            return Ok(true);
        };
        let today = Utc::now().date_naive();
        if consume {
            self.store.consume_use(&grant.id, today, max).await
        } else {
            Ok(self.store.uses(&grant.id, today).await? < max)
        }
    }

    async fn find_approval(&self, caller: Caller<'_>, server: &str, tool: &str) -> Result<Option<ToolApproval>> {
        let Some(subject) = caller.subject else {
            return Ok(None);
        };
        let now = Utc::now();
        Ok(self
            .store
            .approvals_for(caller.org_id, subject, server, tool)
            .await?
            .into_iter()
            .find(|a| a.is_active(now)))
    }

    // ── Classifications ──

    /// Insert or replace a classification
    pub async fn set_classification(
        &self,
        org_id: &str,
        set_by: Option<&str>,
        input: ClassificationInput,
    ) -> Result<ToolClassification> {
        if input.server.trim().is_empty() || input.tool.trim().is_empty() {
            return Err(Error::Validation("server and tool are required".to_string()));
        }
        let now = Utc::now();
        let existing = self
            .store
            .get_classification(org_id, &input.server, &input.tool)
            .await?;
        let requires_approval = input.effective_requires_approval();
        let classification = ToolClassification {
            id: existing
                .as_ref()
                .map_or_else(|| format!("cls_{}", uuid::Uuid::new_v4().simple()), |c| c.id.clone()),
            org_id: org_id.to_string(),
            server: input.server,
            tool: input.tool,
            risk: input.risk,
            requires_approval,
            description: input.description,
            created_by: set_by.map(ToString::to_string),
            created_at: existing.map_or(now, |c| c.created_at),
            updated_at: now,
        };
        self.store.upsert_classification(classification.clone()).await?;
        info!(
            server = %classification.server,
            tool = %classification.tool,
            risk = classification.risk.as_str(),
            requires_approval,
            "Tool classification set"
        );
        Ok(classification)
    }

    /// Classifications of `org_id`
    pub async fn list_classifications(&self, org_id: &str, server: Option<&str>) -> Result<Vec<ToolClassification>> {
        self.store.list_classifications(org_id, server).await
    }

    /// Remove a classification; the tool falls back to the default table
    pub async fn delete_classification(&self, org_id: &str, server: &str, tool: &str) -> Result<()> {
        if !self.store.delete_classification(org_id, server, tool).await? {
            return Err(Error::NotFound(format!("No classification for {server}/{tool}")));
        }
        info!(server = %server, tool = %tool, "Tool classification deleted");
        Ok(())
    }

    // ── Approvals ──

    /// File a pending approval request
    pub async fn request_approval(
        &self,
        caller: Caller<'_>,
        req: ApprovalRequest,
    ) -> Result<ToolApproval> {
        if req.server.trim().is_empty() || req.tool.trim().is_empty() {
            return Err(Error::Validation("server and tool are required".to_string()));
        }
        let Some(subject) = caller.subject else {
            return Err(Error::Validation("Approval requests need a requesting subject".to_string()));
        };
        let approval = ToolApproval {
            id: format!("apr_{}", uuid::Uuid::new_v4().simple()),
            org_id: caller.org_id.to_string(),
            team_id: req.team_id.or_else(|| caller.team_id.map(ToString::to_string)),
            server: req.server,
            tool: req.tool,
            requested_by: subject.to_string(),
            requested_at: Utc::now(),
            reason: req.reason,
            arguments: req.arguments,
            status: ApprovalStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_note: String::new(),
            expires_at: None,
            trace_id: req.trace_id,
        };
        self.store.insert_approval(approval.clone()).await?;
        info!(
            approval = %approval.id,
            server = %approval.server,
            tool = %approval.tool,
            requested_by = %approval.requested_by,
            "Tool approval requested"
        );
        Ok(approval)
    }

    /// Approval by id within `org_id`
    pub async fn get_approval(&self, org_id: &str, id: &str) -> Result<ToolApproval> {
        match self.store.get_approval(id).await? {
            Some(a) if a.org_id == org_id => Ok(a),
            _ => Err(Error::NotFound(format!("Approval '{id}' not found"))),
        }
    }

    /// Filtered page of approvals, newest first
    pub async fn list_approvals(&self, filter: &ApprovalFilter) -> Result<ApprovalPage> {
        let matched: Vec<ToolApproval> = self
            .store
            .list_approvals()
            .await?
            .into_iter()
            .rev()
            .filter(|a| filter.matches(a))
            .collect();
        let total = matched.len();
        let limit = filter.limit.filter(|l| *l > 0).unwrap_or(50);
        let offset = filter.offset.unwrap_or(0).min(total);
        let approvals: Vec<ToolApproval> = matched.into_iter().skip(offset).take(limit).collect();
        let has_more = offset + approvals.len() < total;
        Ok(ApprovalPage {
            approvals,
            total,
            limit,
            offset,
            has_more,
        })
    }

    /// Approve a pending request, optionally for `expires_in` seconds
    pub async fn approve(&self, org_id: &str, id: &str, reviewer: &str, review: ReviewInput) -> Result<ToolApproval> {
        if review.expires_in.is_some_and(|s| s <= 0) {
            return Err(Error::Validation("expires_in must be positive".to_string()));
        }
        let now = Utc::now();
        let expires_at = review
            .expires_in
            .map(|secs| now + chrono::Duration::seconds(secs));
        self.review(org_id, id, reviewer, Decision::Approve, review.note, expires_at)
            .await
    }

    /// Deny a pending request
    pub async fn deny(&self, org_id: &str, id: &str, reviewer: &str, review: ReviewInput) -> Result<ToolApproval> {
        self.review(org_id, id, reviewer, Decision::Deny, review.note, None)
            .await
    }

    async fn review(
        &self,
        org_id: &str,
        id: &str,
        reviewer: &str,
        decision: Decision,
        note: String,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<ToolApproval> {
        let mut approval = self.get_approval(org_id, id).await?;
        approval.review(decision, reviewer, note, expires_at, Utc::now())?;
        match self
            .store
            .transition_approval(ApprovalStatus::Pending, approval.clone())
            .await?
        {
            Transition::Applied => {}
            Transition::Conflict(status) => return Err(not_pending(status)),
            Transition::Missing => return Err(Error::NotFound(format!("Approval '{id}' not found"))),
        }
        info!(approval = %id, status = approval.status.as_str(), reviewer = %reviewer, "Tool approval reviewed");
        Ok(approval)
    }

    /// Mark approved requests past their expiry as `expired`.
    ///
    /// Access checks do not depend on this; it keeps stored statuses honest
    /// for listings.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut swept = 0;
        for mut approval in self.store.list_approvals().await? {
            if approval.is_lapsed(now) {
                approval.status = ApprovalStatus::Expired;
                let outcome = self
                    .store
                    .transition_approval(ApprovalStatus::Approved, approval)
                    .await?;
                if outcome == Transition::Applied {
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }

    /// Pending requests of `org_id`
    pub async fn pending_count(&self, org_id: &str) -> Result<usize> {
        Ok(self
            .store
            .list_approvals()
            .await?
            .iter()
            .filter(|a| a.org_id == org_id && a.status == ApprovalStatus::Pending)
            .count())
    }

    // ── Grants ──

    /// Grant a user or team use of a tool
    pub async fn grant(&self, org_id: &str, granted_by: Option<&str>, input: GrantInput) -> Result<ToolPermission> {
        input.validate()?;
        let now = Utc::now();
        let permission = ToolPermission {
            id: format!("tperm_{}", uuid::Uuid::new_v4().simple()),
            org_id: org_id.to_string(),
            user_id: input.user_id,
            team_id: input.team_id,
            server: input.server,
            tool: input.tool,
            granted_by: granted_by.map(ToString::to_string),
            granted_at: now,
            expires_at: input.expires_in.map(|s| now + chrono::Duration::seconds(s)),
            max_uses_per_day: input.max_uses_per_day,
        };
        self.store.insert_permission(permission.clone()).await?;
        info!(grant = %permission.id, server = %permission.server, tool = %permission.tool, "Tool permission granted");
        Ok(permission)
    }

    /// Revoke a grant
    pub async fn revoke(&self, org_id: &str, id: &str) -> Result<()> {
        match self.store.get_permission(id).await? {
            Some(p) if p.org_id == org_id => {
                self.store.delete_permission(id).await?;
                info!(grant = %id, "Tool permission revoked");
                Ok(())
            }
            _ => Err(Error::NotFound(format!("Tool permission '{id}' not found"))),
        }
    }

    /// Grants of `org_id`
    pub async fn list_permissions(&self, org_id: &str, server: Option<&str>) -> Result<Vec<ToolPermission>> {
        self.store.list_permissions(org_id, server).await
    }

    /// Create configured classifications and grants
    pub async fn seed(&self, cfg: &ToolsConfig) -> Result<()> {
        for seed in &cfg.classifications {
            self.set_classification(
                &seed.org_id,
                None,
                ClassificationInput {
                    server: seed.server.clone(),
                    tool: seed.tool.clone(),
                    risk: seed.risk,
                    requires_approval: seed.requires_approval,
                    description: seed.description.clone(),
                },
            )
            .await?;
        }
        for seed in &cfg.permissions {
            self.grant(
                &seed.org_id,
                None,
                GrantInput {
                    user_id: seed.user_id.clone(),
                    team_id: seed.team_id.clone(),
                    server: seed.server.clone(),
                    tool: seed.tool.clone(),
                    expires_in: None,
                    max_uses_per_day: seed.max_uses_per_day,
                },
            )
            .await?;
        }
        Ok(())
    }
}

/// Spawn the periodic approval sweep.
pub fn spawn_sweeper(
    controller: Arc<ToolAccessController>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match controller.sweep_expired().await {
                        Ok(0) => {}
                        Ok(n) => debug!(count = n, "Marked lapsed approvals expired"),
                        Err(e) => tracing::warn!(error = %e, "Approval sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Approval sweeper shutting down");
                    break;
                }
            }
        }
    });
}
