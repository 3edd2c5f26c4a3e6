//! Pre-approved tool permissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tool name matching every tool on a server
pub const ANY_TOOL: &str = "*";

/// Who a grant is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grantee<'a> {
    /// A user (or key subject)
    User(&'a str),
    /// A team
    Team(&'a str),
}

/// A grant letting a user or team call a tool without approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermission {
    /// Grant id
    pub id: String,
    /// Organization
    pub org_id: String,
    /// Grantee user (exactly one of user/team)
    pub user_id: Option<String>,
    /// Grantee team (exactly one of user/team)
    pub team_id: Option<String>,
    /// MCP server
    pub server: String,
    /// Tool name or `*`
    pub tool: String,
    /// Who granted it
    pub granted_by: Option<String>,
    /// Grant time
    pub granted_at: DateTime<Utc>,
    /// End of validity
    pub expires_at: Option<DateTime<Utc>>,
    /// Daily use cap
    pub max_uses_per_day: Option<u32>,
}

impl ToolPermission {
    /// Whether the grant is still valid
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|exp| exp > now)
    }

    /// Whether the grant is for `grantee`
    #[must_use]
    pub fn is_for(&self, grantee: &Grantee<'_>) -> bool {
        match grantee {
            Grantee::User(u) => self.user_id.as_deref() == Some(*u),
            Grantee::Team(t) => self.team_id.as_deref() == Some(*t),
        }
    }
}

/// Payload for a new grant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantInput {
    /// Grantee user
    #[serde(default)]
    pub user_id: Option<String>,
    /// Grantee team
    #[serde(default)]
    pub team_id: Option<String>,
    /// MCP server
    pub server: String,
    /// Tool name or `*`
    pub tool: String,
    /// Validity in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Daily use cap
    #[serde(default)]
    pub max_uses_per_day: Option<u32>,
}

impl GrantInput {
    /// Check grantee exclusivity and required fields
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_some() == self.team_id.is_some() {
            return Err(Error::Validation(
                "Exactly one of user_id or team_id is required".to_string(),
            ));
        }
        if self.server.trim().is_empty() || self.tool.trim().is_empty() {
            return Err(Error::Validation("server and tool are required".to_string()));
        }
        if self.expires_in.is_some_and(|s| s <= 0) {
            return Err(Error::Validation("expires_in must be positive".to_string()));
        }
        if self.max_uses_per_day == Some(0) {
            return Err(Error::Validation("max_uses_per_day must be positive".to_string()));
        }
        Ok(())
    }
}

/// Every live grant covering a call, in precedence order: user before team,
/// exact tool before `*`, older before newer within a tier.
#[must_use]
pub fn applicable_grants<'a>(
    grants: &'a [ToolPermission],
    user: Option<&str>,
    team: Option<&str>,
    tool: &str,
    now: DateTime<Utc>,
) -> Vec<&'a ToolPermission> {
    let pair = [tool, ANY_TOOL];
    let names = if tool == ANY_TOOL { &pair[1..] } else { &pair[..] };
    let grantees = user.map(Grantee::User).into_iter().chain(team.map(Grantee::Team));
    let mut out = Vec::new();
    for grantee in grantees {
        for name in names {
            out.extend(
                grants
                    .iter()
                    .filter(|g| g.is_for(&grantee) && g.tool == *name && g.is_live(now)),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(id: &str, user: Option<&str>, team: Option<&str>, tool: &str) -> ToolPermission {
        ToolPermission {
            id: id.to_string(),
            org_id: "acme".to_string(),
            user_id: user.map(ToString::to_string),
            team_id: team.map(ToString::to_string),
            server: "shell".to_string(),
            tool: tool.to_string(),
            granted_by: None,
            granted_at: Utc::now(),
            expires_at: None,
            max_uses_per_day: None,
        }
    }

    #[test]
    fn user_grant_beats_team_grant_and_exact_beats_wildcard() {
        let now = Utc::now();
        let grants = vec![
            grant("team-exact", None, Some("ops"), "run"),
            grant("user-any", Some("alice"), None, "*"),
            grant("user-exact", Some("alice"), None, "run"),
        ];
        let pick = |u, t| applicable_grants(&grants, u, t, "run", now).into_iter().next().map(|g| g.id.as_str());
        assert_eq!(pick(Some("alice"), Some("ops")), Some("user-exact"));
        assert_eq!(pick(Some("bob"), Some("ops")), Some("team-exact"));
        assert_eq!(pick(Some("bob"), None), None);
        assert_eq!(
            applicable_grants(&grants, Some("alice"), None, "other", now).into_iter().next().map(|g| g.id.as_str()),
            Some("user-any")
        );
    }

    #[test]
    fn applicable_grants_follow_precedence() {
        let now = Utc::now();
        let grants = vec![
            grant("team-any", None, Some("ops"), "*"),
            grant("team-exact", None, Some("ops"), "run"),
            grant("user-any", Some("alice"), None, "*"),
            grant("user-exact", Some("alice"), None, "run"),
            grant("other", Some("bob"), None, "run"),
        ];
        let ids: Vec<&str> = applicable_grants(&grants, Some("alice"), Some("ops"), "run", now)
            .into_iter()
            .map(|g| g.id.as_str())
            .collect();
        assert_eq!(ids, ["user-exact", "user-any", "team-exact", "team-any"]);
    }

    #[test]
    fn expired_grants_are_ignored() {
        let now = Utc::now();
        let mut g = grant("old", Some("alice"), None, "run");
        g.expires_at = Some(now - Duration::seconds(1));
        assert!(applicable_grants(&[g], Some("alice"), None, "run", now).is_empty());
    }

    #[test]
    fn input_requires_exactly_one_grantee() {
        let mut input = GrantInput {
            server: "shell".into(),
            tool: "*".into(),
            ..Default::default()
        };
        assert!(input.validate().is_err());
        input.user_id = Some("alice".into());
        assert!(input.validate().is_ok());
        input.team_id = Some("ops".into());
        assert!(input.validate().is_err());
    }
}
