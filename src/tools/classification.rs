//! Tool risk classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk of invoking a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Always allowed
    Safe,
    /// Allowed when approval is not required, or with a grant or approval
    Sensitive,
    /// Allowed only with an explicit grant
    Dangerous,
}

impl RiskLevel {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Sensitive => "sensitive",
            Self::Dangerous => "dangerous",
        }
    }

    /// Approval requirement implied by the level alone
    #[must_use]
    pub fn default_requires_approval(self) -> bool {
        !matches!(self, Self::Safe)
    }
}

/// Risk of a tool nobody classified, by name. Unknown tools are sensitive.
#[must_use]
pub fn default_risk(tool: &str) -> RiskLevel {
    match tool {
        "read_file" | "list_directory" | "get_file_info" | "search_files" | "read_resource"
        | "list_resources" | "list_prompts" | "get_prompt" => RiskLevel::Safe,
        "execute_command" | "run_shell" | "delete_file" | "delete_database" | "drop_table"
        | "admin_action" => RiskLevel::Dangerous,
        // write_file, create_file, update_file, execute_sql, query_database,
        // send_email, create_webhook and everything unknown
        _ => RiskLevel::Sensitive,
    }
}

/// Stored classification, unique per `(org, server, tool)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolClassification {
    /// Classification id
    pub id: String,
    /// Organization
    pub org_id: String,
    /// MCP server
    pub server: String,
    /// Tool
    pub tool: String,
    /// Risk level
    pub risk: RiskLevel,
    /// Whether calls need a grant or approval
    pub requires_approval: bool,
    /// Description
    pub description: String,
    /// Who set it
    pub created_by: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationInput {
    /// MCP server
    pub server: String,
    /// Tool
    pub tool: String,
    /// Risk level
    pub risk: RiskLevel,
    /// Approval requirement; only honored for sensitive tools
    #[serde(default)]
    pub requires_approval: Option<bool>,
    /// Description
    #[serde(default)]
    pub description: String,
}

impl ClassificationInput {
    /// Effective approval flag: safe never requires approval, dangerous always does
    #[must_use]
    pub fn effective_requires_approval(&self) -> bool {
        match self.risk {
            RiskLevel::Safe => false,
            RiskLevel::Dangerous => true,
            RiskLevel::Sensitive => self.requires_approval.unwrap_or(true),
        }
    }
}

/// Where a tool's effective classification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// An explicit classification
    Configured,
    /// The built-in name table
    Default,
}

/// Effective classification of a `(server, tool)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveRisk {
    /// Risk level
    pub risk: RiskLevel,
    /// Whether calls need a grant or approval
    pub requires_approval: bool,
    /// Source
    pub source: ClassificationSource,
}

impl EffectiveRisk {
    /// Effective classification from an optional stored one
    #[must_use]
    pub fn resolve(stored: Option<&ToolClassification>, tool: &str) -> Self {
        match stored {
            Some(c) => Self {
                risk: c.risk,
                requires_approval: c.requires_approval,
                source: ClassificationSource::Configured,
            },
            None => {
                let risk = default_risk(tool);
                Self {
                    risk,
                    requires_approval: risk.default_requires_approval(),
                    source: ClassificationSource::Default,
                }
            }
        }
    }
}
