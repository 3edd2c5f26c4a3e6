//! Tool risk classification and approval gating.
//!
//! Every `(server, tool)` pair has an effective [`RiskLevel`], either from an
//! explicit [`ToolClassification`] or from a built-in table keyed by tool
//! name. Safe tools always pass, dangerous tools need a [`ToolPermission`]
//! grant, and sensitive tools that require approval need a grant or an
//! approved [`ToolApproval`].

mod approval;
mod classification;
mod controller;
mod grant;
mod store;

pub use approval::{
    ApprovalFilter, ApprovalPage, ApprovalRequest, ApprovalStatus, Decision, ReviewInput,
    ToolApproval,
};
pub use classification::{
    ClassificationInput, ClassificationSource, EffectiveRisk, RiskLevel, ToolClassification,
    default_risk,
};
pub use controller::{
    APPROVAL_REASON, AccessDecision, AccessVia, Caller, DAILY_CAP_REASON, DANGEROUS_REASON,
    ToolAccessController, spawn_sweeper,
};
pub use grant::{ANY_TOOL, GrantInput, Grantee, ToolPermission, applicable_grants};
pub use store::{InMemoryToolStore, MAX_APPROVALS, ToolStore, Transition};
