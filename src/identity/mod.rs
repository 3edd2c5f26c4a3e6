//! Identity resolution.
//!
//! Turns a presented credential into a [`Principal`]:
//!
//! - API keys (`Authorization: Bearer gwo_prd_<hex>`) resolve through a
//!   [`KeyStore`] and carry a flat permission list.
//! - Session tokens (`Bearer gwo_session_<id>` or the session cookie) resolve
//!   through a [`SessionStore`] and defer permissions to role assignments.
//!
//! A principal lives only for the duration of one request.

mod keys;
mod resolver;
mod sessions;

pub use keys::{ApiKeyRecord, InMemoryKeyStore, IssuedKey, KeyManager, KeyStore, NewApiKey, generate_key, hash_key};
pub use resolver::IdentityResolver;
pub use sessions::{InMemorySessionStore, SessionStore, UserSession, spawn_reaper as spawn_session_reaper};

use gateway_core::KeyEnvironment;
use serde::Serialize;

/// Where a principal's permissions come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "permissions", rename_all = "snake_case")]
pub enum PermissionSource {
    /// Flat permission list carried by an API key
    Flat(Vec<String>),
    /// Role assignments of the principal's user
    Roles,
}

/// How the principal authenticated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    /// API key
    ApiKey {
        /// Environment encoded in the key
        environment: KeyEnvironment,
    },
    /// Browser or CLI session
    Session {
        /// Session id
        session_id: String,
    },
}

/// Resolved identity attached to a request
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    /// Organization
    pub org_id: String,
    /// User, when known
    pub user_id: Option<String>,
    /// API key id, for key-based principals
    pub key_id: Option<String>,
    /// Team, when known
    pub team_id: Option<String>,
    /// Permission source
    pub permissions: PermissionSource,
    /// Requests per minute (0 = gateway default)
    pub rate_limit: u32,
    /// Authentication method
    pub method: AuthMethod,
}

impl Principal {
    /// Stable identifier of the acting subject: the user if known, else the key
    #[must_use]
    pub fn subject(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.key_id.as_deref())
            .unwrap_or("anonymous")
    }

    /// Rate-limit bucket key: `org:key-id` (or `org:user` for sessions)
    #[must_use]
    pub fn rate_limit_key(&self) -> String {
        let id = self
            .key_id
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or("anonymous");
        format!("{}:{id}", self.org_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_principal() -> Principal {
        Principal {
            org_id: "acme".to_string(),
            user_id: Some("alice".to_string()),
            key_id: Some("key_1".to_string()),
            team_id: None,
            permissions: PermissionSource::Flat(vec!["mcp:read".to_string()]),
            rate_limit: 10,
            method: AuthMethod::ApiKey {
                environment: KeyEnvironment::Dev,
            },
        }
    }

    #[test]
    fn rate_limit_key_prefers_key_id() {
        assert_eq!(key_principal().rate_limit_key(), "acme:key_1");
    }

    #[test]
    fn session_principal_keys_by_user() {
        let p = Principal {
            key_id: None,
            permissions: PermissionSource::Roles,
            method: AuthMethod::Session {
                session_id: "s1".to_string(),
            },
            ..key_principal()
        };
        assert_eq!(p.rate_limit_key(), "acme:alice");
        assert_eq!(p.subject(), "alice");
    }
}
