//! Permission strings and wildcard matching.
//!
//! A permission is a colon-separated string such as `mcp:call`. A granted
//! permission matches a required one when it is:
//!
//! - the global wildcard `*`,
//! - an exact match, or
//! - a prefix pattern ending in `*` (`mcp:*` matches `mcp:read`).
//!
//! There is no other pattern syntax. An empty required permission never
//! matches.

/// Every permission.
pub const ALL: &str = "*";

/// List MCP servers and tools.
pub const MCP_READ: &str = "mcp:read";
/// Modify MCP server configuration.
pub const MCP_WRITE: &str = "mcp:write";
/// Invoke MCP tools.
pub const MCP_CALL: &str = "mcp:call";

/// Read all traces in the organization.
pub const TRACES_READ: &str = "traces:read";
/// Read only traces the caller produced.
pub const TRACES_READ_OWN: &str = "traces:read:own";
/// Export traces.
pub const TRACES_EXPORT: &str = "traces:export";

/// Read organization-wide costs.
pub const COSTS_READ: &str = "costs:read";
/// Read team costs.
pub const COSTS_READ_TEAM: &str = "costs:read:team";
/// Export cost reports.
pub const COSTS_EXPORT: &str = "costs:export";

/// Read audit logs.
pub const AUDIT_READ: &str = "audit:read";
/// Export audit logs.
pub const AUDIT_EXPORT: &str = "audit:export";

/// List API keys.
pub const KEYS_READ: &str = "keys:read";
/// Create API keys.
pub const KEYS_CREATE: &str = "keys:create";
/// Revoke API keys.
pub const KEYS_REVOKE: &str = "keys:revoke";
/// Rotate API keys.
pub const KEYS_ROTATE: &str = "keys:rotate";

/// Read roles and assignments.
pub const RBAC_READ: &str = "rbac:read";
/// Manage roles and assignments.
pub const RBAC_ADMIN: &str = "rbac:admin";

/// Manage users.
pub const USERS_ALL: &str = "users:*";
/// Manage teams.
pub const TEAMS_ALL: &str = "teams:*";

/// Read safety policies, classifications and detections.
pub const POLICIES_READ: &str = "policies:read";
/// Manage safety policies, classifications and tool grants.
pub const POLICIES_ADMIN: &str = "policies:admin";

/// Read approval requests.
pub const APPROVALS_READ: &str = "approvals:read";
/// Submit approval requests.
pub const APPROVALS_REQUEST: &str = "approvals:request";
/// Approve or deny approval requests.
pub const APPROVALS_REVIEW: &str = "approvals:review";

/// Read alert rules.
pub const ALERTS_READ: &str = "alerts:read";
/// Manage alert rules.
pub const ALERTS_ADMIN: &str = "alerts:admin";

/// Read settings.
pub const SETTINGS_READ: &str = "settings:read";
/// Manage settings.
pub const SETTINGS_ADMIN: &str = "settings:admin";

/// Every permission constant known to the gateway.
pub const KNOWN: &[&str] = &[
    ALL,
    MCP_READ,
    MCP_WRITE,
    MCP_CALL,
    TRACES_READ,
    TRACES_READ_OWN,
    TRACES_EXPORT,
    COSTS_READ,
    COSTS_READ_TEAM,
    COSTS_EXPORT,
    AUDIT_READ,
    AUDIT_EXPORT,
    KEYS_READ,
    KEYS_CREATE,
    KEYS_REVOKE,
    KEYS_ROTATE,
    RBAC_READ,
    RBAC_ADMIN,
    USERS_ALL,
    TEAMS_ALL,
    POLICIES_READ,
    POLICIES_ADMIN,
    APPROVALS_READ,
    APPROVALS_REQUEST,
    APPROVALS_REVIEW,
    ALERTS_READ,
    ALERTS_ADMIN,
    SETTINGS_READ,
    SETTINGS_ADMIN,
];

/// Returns `true` if `granted` covers `required`.
#[must_use]
pub fn grants(granted: &str, required: &str) -> bool {
    if required.is_empty() {
        return false;
    }
    if granted == ALL || granted == required {
        return true;
    }
    match granted.strip_suffix('*') {
        Some(prefix) => required.starts_with(prefix),
        None => false,
    }
}

/// Returns `true` if any permission in `granted` covers `required`.
pub fn grants_any<I, S>(granted: I, required: &str) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    granted.into_iter().any(|g| grants(g.as_ref(), required))
}

/// Split a flat comma-separated permission string (`"mcp:read, mcp:call"`).
#[must_use]
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Returns `true` if `permission` is a known constant or a wildcard pattern.
#[must_use]
pub fn is_valid(permission: &str) -> bool {
    KNOWN.contains(&permission)
        || permission
            .strip_suffix(":*")
            .is_some_and(|ns| !ns.is_empty() && !ns.contains('*'))
}
