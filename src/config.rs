//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::rbac::Scope;
use crate::safety::PolicyInput;
use crate::tools::RiskLevel;
use crate::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "MCP_POLICY_GATEWAY_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Credential resolution
    pub auth: AuthConfig,
    /// Per-key request quotas
    pub rate_limit: RateLimitConfig,
    /// Prompt-injection detection
    pub safety: SafetyConfig,
    /// Tool risk classification and approvals
    pub tools: ToolsConfig,
    /// Roles and role assignments
    pub rbac: RbacConfig,
    /// Audit log
    pub audit: AuditConfig,
    /// Batch tool-call execution
    pub batch: BatchConfig,
    /// Upstream MCP servers keyed by name
    pub servers: HashMap<String, UpstreamConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
        }
    }
}

/// Credential resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Prefix of API keys and session bearer tokens (`gwo_prd_...`)
    pub key_prefix: String,
    /// Name of the session cookie
    pub session_cookie: String,
    /// Paths that bypass identity resolution
    pub public_paths: Vec<String>,
    /// API keys seeded at startup
    pub api_keys: Vec<ApiKeyConfig>,
    /// Sessions seeded at startup
    pub sessions: Vec<SessionConfig>,
    /// How often expired sessions are reaped
    #[serde(with = "humantime_serde")]
    pub session_reap_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_prefix: "gwo".to_string(),
            session_cookie: "gwo_session".to_string(),
            public_paths: vec![
                "/health".to_string(),
                "/ready".to_string(),
                "/version".to_string(),
            ],
            api_keys: Vec::new(),
            sessions: Vec::new(),
            session_reap_interval: Duration::from_secs(300),
        }
    }
}

impl AuthConfig {
    /// Check if a path is public (bypasses identity resolution)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path == p)
    }
}

/// API key seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// The full key value (supports `env:VAR_NAME`)
    pub key: String,
    /// Stable key id (generated when absent)
    #[serde(default)]
    pub key_id: Option<String>,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Owning organization
    pub org_id: String,
    /// User the key acts for
    #[serde(default)]
    pub user_id: Option<String>,
    /// Team the key belongs to
    #[serde(default)]
    pub team_id: Option<String>,
    /// Comma-separated permissions (`"mcp:read,mcp:call"`)
    #[serde(default)]
    pub permissions: String,
    /// Requests per minute (0 = gateway default)
    #[serde(default)]
    pub rate_limit: u32,
    /// Expiry timestamp
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyConfig {
    /// Resolve the API key (expand env vars)
    #[must_use]
    pub fn resolve_key(&self) -> String {
        if let Some(var_name) = self.key.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| self.key.clone())
        } else {
            self.key.clone()
        }
    }
}

/// Session seeded from configuration (normally created by the login flow)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session id (UUID)
    pub id: String,
    /// User the session belongs to
    pub user_id: String,
    /// Organization of the user
    pub org_id: String,
    /// Team of the user
    #[serde(default)]
    pub team_id: Option<String>,
    /// Lifetime from startup
    #[serde(with = "humantime_serde", default = "default_session_ttl")]
    pub ttl: Duration,
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Quota used when a principal carries none
    pub default_per_minute: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How often stale windows are evicted
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_per_minute: 1000,
            window: Duration::from_secs(60),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Prompt-injection detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Enable the safety stage
    pub enabled: bool,
    /// Detections kept in memory
    pub max_detections: usize,
    /// Worker queue capacity for detection persistence
    pub queue_capacity: usize,
    /// Policies seeded at startup
    pub policies: Vec<PolicySeed>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_detections: 1000,
            queue_capacity: 1024,
            policies: Vec::new(),
        }
    }
}

/// Safety policy seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySeed {
    /// Owning organization
    pub org_id: String,
    /// Policy body
    #[serde(flatten)]
    pub policy: PolicyInput,
}

/// Tool access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Classifications seeded at startup
    pub classifications: Vec<ClassificationSeed>,
    /// Tool permission grants seeded at startup
    pub permissions: Vec<GrantSeed>,
    /// How often approved-and-expired approvals are marked expired
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            classifications: Vec::new(),
            permissions: Vec::new(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Tool classification seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationSeed {
    /// Owning organization
    pub org_id: String,
    /// MCP server name
    pub server: String,
    /// Tool name
    pub tool: String,
    /// Risk level
    pub risk: RiskLevel,
    /// Approval requirement (defaults from the risk level)
    #[serde(default)]
    pub requires_approval: Option<bool>,
    /// Description
    #[serde(default)]
    pub description: String,
}

/// Tool permission grant seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantSeed {
    /// Owning organization
    pub org_id: String,
    /// Grantee user (exactly one of user/team)
    #[serde(default)]
    pub user_id: Option<String>,
    /// Grantee team (exactly one of user/team)
    #[serde(default)]
    pub team_id: Option<String>,
    /// MCP server name
    pub server: String,
    /// Tool name or `*`
    pub tool: String,
    /// Daily use cap
    #[serde(default)]
    pub max_uses_per_day: Option<u32>,
}

/// RBAC configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RbacConfig {
    /// Custom roles seeded at startup
    pub roles: Vec<RoleSeed>,
    /// Role assignments seeded at startup
    pub assignments: Vec<AssignmentSeed>,
}

/// Custom role seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSeed {
    /// Owning organization
    pub org_id: String,
    /// Role name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Permissions
    pub permissions: Vec<String>,
}

/// Role assignment seeded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentSeed {
    /// User receiving the role
    pub user_id: String,
    /// Organization the role is looked up in (built-ins are visible everywhere)
    pub org_id: String,
    /// Role name
    pub role: String,
    /// Assignment scope
    #[serde(default)]
    pub scope: Scope,
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Enable the audit recorder
    pub enabled: bool,
    /// Records kept in memory
    pub capacity: usize,
    /// Worker queue capacity
    pub queue_capacity: usize,
    /// Age after which records are purged
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// How often the retention purge runs
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
            queue_capacity: 1024,
            retention: Duration::from_secs(30 * 24 * 3600),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

/// Batch tool-call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum calls per batch
    pub max_calls: usize,
    /// Overall deadline when the request names none
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_calls: 20,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Upstream MCP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL (`http://localhost:9001`)
    pub url: String,
    /// Per-call deadline
    #[serde(with = "humantime_serde", default = "default_upstream_timeout")]
    pub timeout: Duration,
    /// Pricing
    #[serde(default)]
    pub pricing: PricingConfig,
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Static pricing for an upstream server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Price of one call in USD
    pub per_call: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self { per_call: 0.001 }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.auth.key_prefix.is_empty() || self.auth.key_prefix.contains('_') {
            return Err(Error::Config(
                "auth.key_prefix must be non-empty and must not contain '_'".to_string(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::Config("rate_limit.window must be positive".to_string()));
        }
        for (name, server) in &self.servers {
            url::Url::parse(&server.url).map_err(|e| {
                Error::Config(format!("servers.{name}.url is not a valid URL: {e}"))
            })?;
            if server.pricing.per_call < 0.0 {
                return Err(Error::Config(format!(
                    "servers.{name}.pricing.per_call must not be negative"
                )));
            }
        }
        for grant in &self.tools.permissions {
            if grant.user_id.is_some() == grant.team_id.is_some() {
                return Err(Error::Config(format!(
                    "tools.permissions for {}/{} must name exactly one of user_id or team_id",
                    grant.server, grant.tool
                )));
            }
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.starts_with('~'), dirs::home_dir()) {
                (true, Some(home)) => path_str.replacen('~', &home.display().to_string(), 1),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in upstream URLs
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for server in self.servers.values_mut() {
            server.url = Self::expand_string(&re, &server.url);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string ("250ms", "30s", "5m", "12h", "30d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string; a bare number is seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

/// Query-string lists written as `a,b,c`
pub mod comma_list {
    use serde::de::{self, DeserializeOwned};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Deserialize a comma-separated string into a list of `T`.
    ///
    /// Each item is parsed as a JSON string, so unit enums with renamed
    /// variants work.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if any item is not a valid `T`.
    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let raw = String::deserialize(deserializer)?;
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| serde_json::from_value(Value::String(item.to_string())).map_err(de::Error::custom))
            .collect()
    }
}
