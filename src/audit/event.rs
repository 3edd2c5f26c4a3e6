//! Audit records and their derivation from HTTP exchanges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    /// Tool invocation (single or batch)
    #[serde(rename = "mcp.tool.call")]
    McpToolCall,
    /// Tool listing
    #[serde(rename = "mcp.tool.list")]
    McpToolList,
    /// Resource read or listing
    #[serde(rename = "mcp.resource.get")]
    McpResourceGet,
    /// API key created
    #[serde(rename = "api_key.create")]
    ApiKeyCreate,
    /// API key revoked
    #[serde(rename = "api_key.revoke")]
    ApiKeyRevoke,
    /// API key rotated
    #[serde(rename = "api_key.rotate")]
    ApiKeyRotate,
    /// Role created
    #[serde(rename = "role.create")]
    RoleCreate,
    /// Role updated
    #[serde(rename = "role.update")]
    RoleUpdate,
    /// Role deleted
    #[serde(rename = "role.delete")]
    RoleDelete,
    /// Role assigned to a user
    #[serde(rename = "role.assign")]
    RoleAssign,
    /// Role assignment removed
    #[serde(rename = "role.revoke")]
    RoleRevoke,
    /// Safety policy created
    #[serde(rename = "policy.create")]
    PolicyCreate,
    /// Safety policy updated
    #[serde(rename = "policy.update")]
    PolicyUpdate,
    /// Safety policy deleted
    #[serde(rename = "policy.delete")]
    PolicyDelete,
    /// Tool approval requested
    #[serde(rename = "approval.create")]
    ApprovalCreate,
    /// Tool approval granted
    #[serde(rename = "approval.grant")]
    ApprovalGrant,
    /// Tool approval denied
    #[serde(rename = "approval.deny")]
    ApprovalDeny,
    /// Tool classification or grant changed
    #[serde(rename = "config.change")]
    ConfigChange,
}

impl AuditAction {
    /// Dotted name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::McpToolCall => "mcp.tool.call",
            Self::McpToolList => "mcp.tool.list",
            Self::McpResourceGet => "mcp.resource.get",
            Self::ApiKeyCreate => "api_key.create",
            Self::ApiKeyRevoke => "api_key.revoke",
            Self::ApiKeyRotate => "api_key.rotate",
            Self::RoleCreate => "role.create",
            Self::RoleUpdate => "role.update",
            Self::RoleDelete => "role.delete",
            Self::RoleAssign => "role.assign",
            Self::RoleRevoke => "role.revoke",
            Self::PolicyCreate => "policy.create",
            Self::PolicyUpdate => "policy.update",
            Self::PolicyDelete => "policy.delete",
            Self::ApprovalCreate => "approval.create",
            Self::ApprovalGrant => "approval.grant",
            Self::ApprovalDeny => "approval.deny",
            Self::ConfigChange => "config.change",
        }
    }
}

/// Result of an audited request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// 2xx
    Success,
    /// Any other error
    Failure,
    /// Deliberate denial (400, 403, 429)
    Blocked,
}

impl AuditOutcome {
    /// Classify a response status code
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            400 | 403 | 429 => Self::Blocked,
            _ => Self::Failure,
        }
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
        }
    }
}

/// An audit log entry. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    /// Record id
    pub id: String,
    /// Organization, absent for unauthenticated requests
    pub org_id: Option<String>,
    /// Team
    pub team_id: Option<String>,
    /// User
    pub user_id: Option<String>,
    /// API key
    pub key_id: Option<String>,
    /// Trace id
    pub trace_id: Option<String>,
    /// Action
    pub action: AuditAction,
    /// Resource kind, e.g. `mcp:filesystem` or `role`
    pub resource: String,
    /// Resource id when the route names one
    pub resource_id: Option<String>,
    /// Outcome
    pub outcome: AuditOutcome,
    /// Response status code
    pub status: u16,
    /// Action-specific details
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
    /// Client IP
    pub ip_address: Option<String>,
    /// Client user agent
    pub user_agent: Option<String>,
    /// Request id
    pub request_id: Option<String>,
    /// Handling time
    pub duration_ms: u64,
    /// Record time
    pub created_at: DateTime<Utc>,
}

/// Action, resource and resource id derived from a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAction {
    /// Action
    pub action: AuditAction,
    /// Resource kind
    pub resource: String,
    /// Resource id
    pub resource_id: Option<String>,
}

impl RouteAction {
    fn new(action: AuditAction, resource: impl Into<String>, resource_id: Option<&str>) -> Self {
        Self {
            action,
            resource: resource.into(),
            resource_id: resource_id.map(ToString::to_string),
        }
    }
}

/// Map a request to its audit action. Routes not listed are not audited.
#[must_use]
pub fn derive_action(method: &str, path: &str) -> Option<RouteAction> {
    use AuditAction as A;

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let route = match (method, segments.as_slice()) {
        ("POST", ["v1", "mcp", server, "tools", "call" | "batch"]) => {
            RouteAction::new(A::McpToolCall, format!("mcp:{server}"), None)
        }
        ("POST", ["v1", "mcp", server, "tools", "list"]) => {
            RouteAction::new(A::McpToolList, format!("mcp:{server}"), None)
        }
        ("POST", ["v1", "mcp", server, "resources", _]) => {
            RouteAction::new(A::McpResourceGet, format!("mcp:{server}"), None)
        }

        ("POST", ["v1", "api-keys"]) => RouteAction::new(A::ApiKeyCreate, "api_key", None),
        ("POST", ["v1", "api-keys", id, "rotate"]) => RouteAction::new(A::ApiKeyRotate, "api_key", Some(*id)),
        ("DELETE", ["v1", "api-keys", id]) => RouteAction::new(A::ApiKeyRevoke, "api_key", Some(*id)),

        ("POST", ["v1", "safety", "policies"]) => RouteAction::new(A::PolicyCreate, "safety_policy", None),
        ("PUT", ["v1", "safety", "policies", id]) => RouteAction::new(A::PolicyUpdate, "safety_policy", Some(*id)),
        ("DELETE", ["v1", "safety", "policies", id]) => {
            RouteAction::new(A::PolicyDelete, "safety_policy", Some(*id))
        }

        ("POST", ["v1", "roles"]) => RouteAction::new(A::RoleCreate, "role", None),
        ("PUT", ["v1", "roles", id]) => RouteAction::new(A::RoleUpdate, "role", Some(*id)),
        ("DELETE", ["v1", "roles", id]) => RouteAction::new(A::RoleDelete, "role", Some(*id)),
        ("POST", ["v1", "role-assignments"]) => RouteAction::new(A::RoleAssign, "role_assignment", None),
        ("DELETE", ["v1", "role-assignments", id]) => {
            RouteAction::new(A::RoleRevoke, "role_assignment", Some(*id))
        }

        ("POST", ["v1", "tools", "approvals"]) => RouteAction::new(A::ApprovalCreate, "tool_approval", None),
        ("POST", ["v1", "tools", "approvals", id, "approve"]) => {
            RouteAction::new(A::ApprovalGrant, "tool_approval", Some(*id))
        }
        ("POST", ["v1", "tools", "approvals", id, "deny"]) => {
            RouteAction::new(A::ApprovalDeny, "tool_approval", Some(*id))
        }

        ("PUT", ["v1", "tools", "classifications"]) => {
            RouteAction::new(A::ConfigChange, "tool_classification", None)
        }
        ("DELETE", ["v1", "tools", "classifications", server, tool]) => RouteAction::new(
            A::ConfigChange,
            "tool_classification",
            Some(format!("{server}/{tool}").as_str()),
        ),
        ("POST", ["v1", "tools", "permissions"]) => RouteAction::new(A::ConfigChange, "tool_permission", None),
        ("DELETE", ["v1", "tools", "permissions", id]) => {
            RouteAction::new(A::ConfigChange, "tool_permission", Some(*id))
        }

        _ => return None,
    };
    Some(route)
}

/// Pull action-specific fields out of a request body.
///
/// Best effort: a body that is not a JSON object yields no details.
#[must_use]
pub fn extract_details(action: AuditAction, body: &[u8]) -> Map<String, Value> {
    let mut details = Map::new();
    let Ok(Value::Object(data)) = serde_json::from_slice::<Value>(body) else {
        return details;
    };
    let mut copy = |from: &str, to: &str| {
        if let Some(v) = data.get(from).filter(|v| v.is_string() || v.is_number() || v.is_boolean()) {
            details.insert(to.to_string(), v.clone());
        }
    };

    match action {
        AuditAction::McpToolCall => {
            if data.contains_key("tool") {
                copy("tool", "tool_name");
            } else {
                copy("name", "tool_name");
            }
        }
        AuditAction::McpResourceGet => copy("uri", "uri"),
        AuditAction::ApiKeyCreate => {
            copy("name", "key_name");
            copy("environment", "environment");
        }
        AuditAction::PolicyCreate | AuditAction::PolicyUpdate => {
            copy("name", "policy_name");
            copy("mode", "mode");
            copy("sensitivity", "sensitivity");
        }
        AuditAction::RoleCreate | AuditAction::RoleUpdate => copy("name", "role_name"),
        AuditAction::RoleAssign => {
            copy("user_id", "user_id");
            copy("role_id", "role_id");
        }
        AuditAction::ApprovalCreate => {
            copy("server", "server");
            copy("tool", "tool");
        }
        AuditAction::ApprovalGrant => copy("expires_in", "expires_in"),
        AuditAction::ConfigChange => {
            copy("server", "server");
            copy("tool", "tool");
            copy("risk", "risk");
        }
        _ => {}
    }
    if action == AuditAction::McpToolCall
        && let Some(Value::Array(calls)) = data.get("calls")
    {
        details.insert("call_count".to_string(), Value::from(calls.len()));
    }
    details
}
