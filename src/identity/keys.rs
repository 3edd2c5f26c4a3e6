//! API key store and lifecycle.
//!
//! Keys are never stored in plaintext. Records are indexed by the SHA-256 hex
//! digest of the full key so lookups do not need the secret, and by key id
//! for management operations.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use gateway_core::{KeyEnvironment, permission};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::ApiKeyConfig;
use crate::{Error, Result};

/// Stored API key (no secret material)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Key id
    pub key_id: String,
    /// Human-readable name
    pub name: String,
    /// SHA-256 hex digest of the full key
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// Leading characters of the key, safe to display
    pub display_prefix: String,
    /// Owning organization
    pub org_id: String,
    /// User the key acts for
    pub user_id: Option<String>,
    /// Team the key belongs to
    pub team_id: Option<String>,
    /// Environment tag
    pub environment: KeyEnvironment,
    /// Flat permission list
    pub permissions: Vec<String>,
    /// Requests per minute (0 = gateway default)
    pub rate_limit: u32,
    /// Creator, when created through the API
    pub created_by: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: Option<DateTime<Utc>>,
    /// Revocation time
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Whether the key has been revoked
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Whether the key has passed its expiry
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// Storage backend for API keys.
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Insert a record (replacing one with the same id)
    async fn insert(&self, record: ApiKeyRecord) -> Result<()>;

    /// Look up by key hash
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>>;

    /// Look up by key id
    async fn get(&self, key_id: &str) -> Result<Option<ApiKeyRecord>>;

    /// All keys of an organization, newest first
    async fn list(&self, org_id: &str) -> Result<Vec<ApiKeyRecord>>;

    /// Mark a key revoked. Returns `false` if it does not exist.
    async fn revoke(&self, key_id: &str, at: DateTime<Utc>) -> Result<bool>;
}

/// In-memory key store backed by two `DashMap` indices.
#[derive(Default)]
pub struct InMemoryKeyStore {
    by_id: DashMap<String, ApiKeyRecord>,
    id_by_hash: DashMap<String, String>,
}

impl InMemoryKeyStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn insert(&self, record: ApiKeyRecord) -> Result<()> {
        self.id_by_hash
            .insert(record.key_hash.clone(), record.key_id.clone());
        self.by_id.insert(record.key_id.clone(), record);
        Ok(())
    }

    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>> {
        let Some(id) = self.id_by_hash.get(key_hash).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(self.by_id.get(&id).map(|e| e.value().clone()))
    }

    async fn get(&self, key_id: &str) -> Result<Option<ApiKeyRecord>> {
        Ok(self.by_id.get(key_id).map(|e| e.value().clone()))
    }

    async fn list(&self, org_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let mut keys: Vec<ApiKeyRecord> = self
            .by_id
            .iter()
            .filter(|e| e.value().org_id == org_id)
            .map(|e| e.value().clone())
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn revoke(&self, key_id: &str, at: DateTime<Utc>) -> Result<bool> {
        match self.by_id.get_mut(key_id) {
            Some(mut entry) => {
                entry.revoked_at.get_or_insert(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Generate a fresh key: `<prefix>_<env>_<64 hex chars>`.
#[must_use]
pub fn generate_key(prefix: &str, environment: KeyEnvironment) -> String {
    let secret: [u8; 32] = rand::random();
    format!("{prefix}_{environment}_{}", hex::encode(secret))
}

/// SHA-256 hex digest of a full key
#[must_use]
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn display_prefix(key: &str) -> String {
    key.chars().take(12).collect()
}

fn new_key_id() -> String {
    format!("key_{}", uuid::Uuid::new_v4().simple())
}

/// Parameters for a new API key
#[derive(Debug, Clone, Deserialize)]
pub struct NewApiKey {
    /// Human-readable name
    pub name: String,
    /// Environment tag
    pub environment: KeyEnvironment,
    /// Flat permission list
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Requests per minute (0 = gateway default)
    #[serde(default)]
    pub rate_limit: u32,
    /// Team the key belongs to
    #[serde(default)]
    pub team_id: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// A newly created key. The plaintext is only ever returned here.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    /// Stored record
    #[serde(flatten)]
    pub record: ApiKeyRecord,
    /// Full key value
    pub key: String,
}

/// Create, rotate and revoke API keys against a [`KeyStore`].
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    prefix: String,
}

impl KeyManager {
    /// Create a manager issuing keys with `prefix`
    pub fn new(store: Arc<dyn KeyStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// Issue a key for `org_id`, acting as `user_id`.
    pub async fn create(
        &self,
        org_id: &str,
        user_id: Option<&str>,
        created_by: Option<&str>,
        req: NewApiKey,
    ) -> Result<IssuedKey> {
        if req.name.trim().is_empty() {
            return Err(Error::Validation("name is required".to_string()));
        }
        if let Some(bad) = req.permissions.iter().find(|p| !permission::is_valid(p)) {
            return Err(Error::Validation(format!("unknown permission '{bad}'")));
        }
        let now = Utc::now();
        let expires_at = match req.expires_in {
            Some(secs) if secs <= 0 => {
                return Err(Error::Validation("expires_in must be positive".to_string()));
            }
            Some(secs) => Some(now + Duration::seconds(secs)),
            None => None,
        };

        let key = generate_key(&self.prefix, req.environment);
        let record = ApiKeyRecord {
            key_id: new_key_id(),
            name: req.name,
            key_hash: hash_key(&key),
            display_prefix: display_prefix(&key),
            org_id: org_id.to_string(),
            user_id: user_id.map(ToString::to_string),
            team_id: req.team_id,
            environment: req.environment,
            permissions: req.permissions,
            rate_limit: req.rate_limit,
            created_by: created_by.map(ToString::to_string),
            created_at: now,
            expires_at,
            revoked_at: None,
        };
        self.store.insert(record.clone()).await?;
        info!(key_id = %record.key_id, org = %record.org_id, env = %record.environment, "API key created");
        Ok(IssuedKey { record, key })
    }

    /// Revoke a key of `org_id`
    pub async fn revoke(&self, org_id: &str, key_id: &str) -> Result<ApiKeyRecord> {
        let record = self.owned(org_id, key_id).await?;
        self.store.revoke(key_id, Utc::now()).await?;
        info!(key_id = %key_id, org = %org_id, "API key revoked");
        self.store
            .get(key_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("API key '{}' not found", record.key_id)))
    }

    /// Revoke a key and issue a replacement with the same attributes
    pub async fn rotate(
        &self,
        org_id: &str,
        key_id: &str,
        rotated_by: Option<&str>,
    ) -> Result<IssuedKey> {
        let old = self.owned(org_id, key_id).await?;
        if old.is_revoked() {
            return Err(Error::Validation("API key is already revoked".to_string()));
        }
        let remaining = old
            .expires_at
            .map(|exp| (exp - Utc::now()).num_seconds().max(1));
        let issued = self
            .create(
                &old.org_id,
                old.user_id.as_deref(),
                rotated_by,
                NewApiKey {
                    name: old.name.clone(),
                    environment: old.environment,
                    permissions: old.permissions.clone(),
                    rate_limit: old.rate_limit,
                    team_id: old.team_id.clone(),
                    expires_in: remaining,
                },
            )
            .await?;
        self.store.revoke(key_id, Utc::now()).await?;
        info!(old = %key_id, new = %issued.record.key_id, "API key rotated");
        Ok(issued)
    }

    /// Register a key from configuration
    pub async fn seed(&self, cfg: &ApiKeyConfig) -> Result<ApiKeyRecord> {
        let key = cfg.resolve_key();
        let parts = gateway_core::ApiKeyParts::parse(&key, &self.prefix)
            .map_err(|e| Error::Config(format!("api key '{}': {e}", cfg.name)))?;
        let record = ApiKeyRecord {
            key_id: cfg.key_id.clone().unwrap_or_else(new_key_id),
            name: cfg.name.clone(),
            key_hash: hash_key(&key),
            display_prefix: display_prefix(&key),
            org_id: cfg.org_id.clone(),
            user_id: cfg.user_id.clone(),
            team_id: cfg.team_id.clone(),
            environment: parts.environment,
            permissions: permission::parse_list(&cfg.permissions),
            rate_limit: cfg.rate_limit,
            created_by: None,
            created_at: Utc::now(),
            expires_at: cfg.expires_at,
            revoked_at: None,
        };
        self.store.insert(record.clone()).await?;
        Ok(record)
    }

    async fn owned(&self, org_id: &str, key_id: &str) -> Result<ApiKeyRecord> {
        match self.store.get(key_id).await? {
            Some(record) if record.org_id == org_id => Ok(record),
            _ => Err(Error::NotFound(format!("API key '{key_id}' not found"))),
        }
    }
}
