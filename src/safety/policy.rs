//! Safety policies and their storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Id of the built-in policy used when an organization has none
pub const DEFAULT_POLICY_ID: &str = "policy_default";

/// Common instruction-override phrases
pub const DEFAULT_BLOCK_PATTERNS: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous",
    "disregard all prior",
    "disregard previous instructions",
    "forget all previous",
    "forget your instructions",
    "you are now",
    "pretend you are",
    "act as if you",
    "new persona",
    "new role",
    "jailbreak",
    "DAN mode",
    "developer mode",
    "ignore your programming",
    "bypass your",
    "override your",
    "system prompt",
    "initial prompt",
    "reveal your prompt",
    "show your instructions",
    "what are your instructions",
];

/// Benign phrasings that override the block list
pub const DEFAULT_ALLOW_PATTERNS: &[&str] = &[
    "summarize the following",
    "please help me",
    "can you explain",
    "what is the",
    "how do I",
];

/// How aggressively block patterns match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Substring anywhere
    Strict,
    /// Whole words
    #[default]
    Moderate,
    /// Standalone phrases
    Permissive,
}

impl Sensitivity {
    /// Severity of a block-pattern match
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::Strict => Severity::High,
            Self::Moderate => Severity::Medium,
            Self::Permissive => Severity::Low,
        }
    }

    /// Confidence of a block-pattern match
    #[must_use]
    pub fn confidence(self) -> f64 {
        match self {
            Self::Strict => 0.6,
            Self::Moderate => 0.8,
            Self::Permissive => 0.95,
        }
    }

    /// Whether the heuristic regexes run at this sensitivity
    #[must_use]
    pub fn runs_heuristics(self) -> bool {
        !matches!(self, Self::Permissive)
    }
}

/// Pipeline effect of a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyMode {
    /// Reject the request
    #[default]
    Block,
    /// Continue with a warning header
    Warn,
    /// Continue silently
    Log,
}

impl SafetyMode {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Warn => "warn",
            Self::Log => "log",
        }
    }
}

/// Detection severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Low
    Low,
    /// Medium
    Medium,
    /// High
    High,
    /// Critical
    Critical,
}

impl Severity {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Detection category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    /// Prompt injection
    #[default]
    PromptInjection,
    /// Personal data
    Pii,
    /// Credentials or secrets
    Secret,
    /// Malicious content
    Malicious,
}

impl DetectionType {
    /// Snake-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptInjection => "prompt_injection",
            Self::Pii => "pii",
            Self::Secret => "secret",
            Self::Malicious => "malicious",
        }
    }
}

/// Block and allow pattern lists
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPatterns {
    /// Patterns that trigger a detection
    pub block: Vec<String>,
    /// Patterns that suppress detection entirely
    pub allow: Vec<String>,
}

impl SafetyPatterns {
    /// The built-in pattern set
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            block: DEFAULT_BLOCK_PATTERNS.iter().map(ToString::to_string).collect(),
            allow: DEFAULT_ALLOW_PATTERNS.iter().map(ToString::to_string).collect(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Create/update payload for a policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInput {
    /// Name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Sensitivity
    #[serde(default)]
    pub sensitivity: Sensitivity,
    /// Mode
    #[serde(default)]
    pub mode: SafetyMode,
    /// Patterns
    #[serde(default)]
    pub patterns: SafetyPatterns,
    /// Servers the policy applies to (empty = all)
    #[serde(default, alias = "mcp_servers")]
    pub servers: Vec<String>,
    /// Whether the policy is evaluated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A stored safety policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    /// Policy id
    pub id: String,
    /// Owning organization (`None` for the built-in default)
    pub org_id: Option<String>,
    /// Name
    pub name: String,
    /// Description
    pub description: String,
    /// Sensitivity
    pub sensitivity: Sensitivity,
    /// Mode
    pub mode: SafetyMode,
    /// Patterns
    pub patterns: SafetyPatterns,
    /// Servers the policy applies to (empty = all)
    pub servers: Vec<String>,
    /// Whether the policy is evaluated
    pub enabled: bool,
    /// Creator
    pub created_by: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl SafetyPolicy {
    /// Built-in policy used for organizations without policies: default
    /// patterns, moderate sensitivity, warn only.
    #[must_use]
    pub fn builtin_default() -> Self {
        let epoch = DateTime::<Utc>::default();
        Self {
            id: DEFAULT_POLICY_ID.to_string(),
            org_id: None,
            name: "Default Policy".to_string(),
            description: "Default prompt injection detection policy".to_string(),
            sensitivity: Sensitivity::Moderate,
            mode: SafetyMode::Warn,
            patterns: SafetyPatterns::builtin(),
            servers: Vec::new(),
            enabled: true,
            created_by: None,
            created_at: epoch,
            updated_at: epoch,
        }
    }

    /// Whether the policy covers `server`
    #[must_use]
    pub fn applies_to(&self, server: Option<&str>) -> bool {
        match server {
            Some(server) => self.servers.is_empty() || self.servers.iter().any(|s| s == server),
            None => true,
        }
    }
}

/// Storage backend for policies.
///
/// Listing preserves creation order, which is also evaluation order.
#[async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// Insert a new policy
    async fn insert(&self, policy: SafetyPolicy) -> Result<()>;

    /// Policy by id
    async fn get(&self, id: &str) -> Result<Option<SafetyPolicy>>;

    /// Policies of `org_id` in creation order
    async fn list(&self, org_id: &str) -> Result<Vec<SafetyPolicy>>;

    /// Replace an existing policy. Returns `false` if it does not exist.
    async fn update(&self, policy: SafetyPolicy) -> Result<bool>;

    /// Delete a policy. Returns `false` if it does not exist.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// In-memory policy store
#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<Vec<SafetyPolicy>>,
}

impl InMemoryPolicyStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn insert(&self, policy: SafetyPolicy) -> Result<()> {
        self.policies.write().push(policy);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SafetyPolicy>> {
        Ok(self.policies.read().iter().find(|p| p.id == id).cloned())
    }

    async fn list(&self, org_id: &str) -> Result<Vec<SafetyPolicy>> {
        Ok(self
            .policies
            .read()
            .iter()
            .filter(|p| p.org_id.as_deref() == Some(org_id))
            .cloned()
            .collect())
    }

    async fn update(&self, policy: SafetyPolicy) -> Result<bool> {
        let mut policies = self.policies.write();
        match policies.iter_mut().find(|p| p.id == policy.id) {
            Some(slot) => {
                *slot = policy;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut policies = self.policies.write();
        let before = policies.len();
        policies.retain(|p| p.id != id);
        Ok(policies.len() != before)
    }
}
