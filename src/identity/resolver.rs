//! Credential → principal resolution.

use std::sync::Arc;

use axum::http::{HeaderMap, header};
use chrono::{DateTime, Utc};
use gateway_core::{ApiKeyParts, credential};
use tracing::{debug, warn};

use super::keys::{KeyStore, hash_key};
use super::sessions::{SessionStore, UserSession};
use super::{AuthMethod, PermissionSource, Principal};
use crate::worker::WorkerQueue;
use crate::{Error, Result};

/// Credential pulled from request headers
#[derive(Debug, Clone, PartialEq, Eq)]
enum Credential<'a> {
    ApiKey(&'a str),
    Session(&'a str),
}

/// Resolves credentials into principals.
pub struct IdentityResolver {
    keys: Arc<dyn KeyStore>,
    sessions: Arc<dyn SessionStore>,
    key_prefix: String,
    session_cookie: String,
    activity: WorkerQueue<(String, DateTime<Utc>)>,
}

impl IdentityResolver {
    /// Create a resolver. Spawns the session-activity worker, so it must be
    /// called from within a Tokio runtime.
    pub fn new(
        keys: Arc<dyn KeyStore>,
        sessions: Arc<dyn SessionStore>,
        key_prefix: impl Into<String>,
        session_cookie: impl Into<String>,
    ) -> Self {
        let store = Arc::clone(&sessions);
        let activity = WorkerQueue::spawn("session_activity", 256, move |(id, at): (String, DateTime<Utc>)| {
            let store = Arc::clone(&store);
            async move {
                if let Err(e) = store.touch(&id, at).await {
                    warn!(session = %id, error = %e, "Failed to refresh session activity");
                }
            }
        });
        Self {
            keys,
            sessions,
            key_prefix: key_prefix.into(),
            session_cookie: session_cookie.into(),
            activity,
        }
    }

    /// Resolve the credential carried by `headers`.
    ///
    /// Missing, malformed, unknown, expired and revoked credentials all fail
    /// with [`Error::Unauthorized`]; store failures propagate as-is.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Principal> {
        match self.extract(headers)? {
            Credential::ApiKey(key) => self.resolve_key(key).await,
            Credential::Session(id) => self.resolve_session(id).await,
        }
    }

    fn extract<'a>(&self, headers: &'a HeaderMap) -> Result<Credential<'a>> {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
            .map(str::trim);

        if let Some(token) = bearer {
            if let Some(id) = credential::session_id(token, &self.key_prefix) {
                return Ok(Credential::Session(id));
            }
            return Ok(Credential::ApiKey(token));
        }

        if let Some(id) = self.session_cookie(headers) {
            return Ok(Credential::Session(id));
        }

        Err(Error::Unauthorized(
            "Missing credentials. Use: Authorization: Bearer <api-key>".to_string(),
        ))
    }

    fn session_cookie<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, value)| *name == self.session_cookie && !value.is_empty())
            .map(|(_, value)| value)
    }

    async fn resolve_key(&self, key: &str) -> Result<Principal> {
        // Structural check first, before touching the store
        let parts = ApiKeyParts::parse(key, &self.key_prefix)?;

        let Some(record) = self.keys.find_by_hash(&hash_key(key)).await? else {
            debug!(env = %parts.environment, "Unknown API key");
            return Err(Error::Unauthorized("Invalid API key".to_string()));
        };
        if record.is_revoked() {
            warn!(key_id = %record.key_id, "Revoked API key presented");
            return Err(Error::Unauthorized("API key has been revoked".to_string()));
        }
        if record.is_expired(Utc::now()) {
            warn!(key_id = %record.key_id, "Expired API key presented");
            return Err(Error::Unauthorized("API key has expired".to_string()));
        }

        Ok(Principal {
            org_id: record.org_id,
            user_id: record.user_id,
            key_id: Some(record.key_id),
            team_id: record.team_id,
            permissions: PermissionSource::Flat(record.permissions),
            rate_limit: record.rate_limit,
            method: AuthMethod::ApiKey {
                environment: record.environment,
            },
        })
    }

    async fn resolve_session(&self, id: &str) -> Result<Principal> {
        let Some(session) = self.sessions.get(id).await? else {
            return Err(Error::Unauthorized("Invalid or expired session".to_string()));
        };
        self.activity.dispatch((session.id.clone(), Utc::now()));
        Ok(session_principal(session))
    }
}

fn session_principal(session: UserSession) -> Principal {
    Principal {
        org_id: session.org_id,
        user_id: Some(session.user_id),
        key_id: None,
        team_id: session.team_id,
        permissions: PermissionSource::Roles,
        rate_limit: 0,
        method: AuthMethod::Session {
            session_id: session.id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::keys::{InMemoryKeyStore, KeyManager, NewApiKey};
    use crate::identity::sessions::InMemorySessionStore;
    use axum::http::HeaderValue;
    use gateway_core::KeyEnvironment;

    struct Fixture {
        resolver: IdentityResolver,
        keys: KeyManager,
        sessions: Arc<InMemorySessionStore>,
    }

    fn fixture() -> Fixture {
        let key_store: Arc<dyn KeyStore> = Arc::new(InMemoryKeyStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let resolver = IdentityResolver::new(
            Arc::clone(&key_store),
            Arc::clone(&sessions) as Arc<dyn SessionStore>,
            "gwo",
            "gwo_session",
        );
        Fixture {
            resolver,
            keys: KeyManager::new(key_store, "gwo"),
            sessions,
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn new_key(expires_in: Option<i64>) -> NewApiKey {
        NewApiKey {
            name: "ci".to_string(),
            environment: KeyEnvironment::Dev,
            permissions: vec!["mcp:*".to_string()],
            rate_limit: 50,
            team_id: None,
            expires_in,
        }
    }

    fn session(id: &str) -> UserSession {
        let now = Utc::now();
        UserSession {
            id: id.to_string(),
            user_id: "bob".to_string(),
            org_id: "acme".to_string(),
            team_id: Some("platform".to_string()),
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            last_activity_at: now - chrono::Duration::minutes(5),
            ip_address: None,
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let fx = fixture();
        let err = fx.resolver.resolve(&HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn malformed_key_is_rejected_structurally() {
        let fx = fixture();
        let err = fx.resolver.resolve(&bearer("short")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(msg) if msg.contains("format")));
    }

    #[tokio::test]
    async fn valid_key_resolves_to_flat_principal() {
        // GIVEN: an issued key
        let fx = fixture();
        let issued = fx.keys.create("acme", Some("alice"), None, new_key(None)).await.unwrap();

        // WHEN: it is presented
        let principal = fx.resolver.resolve(&bearer(&issued.key)).await.unwrap();

        // THEN: the principal carries the key's attributes
        assert_eq!(principal.org_id, "acme");
        assert_eq!(principal.key_id.as_deref(), Some(issued.record.key_id.as_str()));
        assert_eq!(principal.rate_limit, 50);
        assert_eq!(principal.permissions, PermissionSource::Flat(vec!["mcp:*".to_string()]));
    }

    #[tokio::test]
    async fn unknown_revoked_and_expired_keys_fail_closed() {
        let fx = fixture();

        let unknown = crate::identity::generate_key("gwo", KeyEnvironment::Dev);
        assert!(fx.resolver.resolve(&bearer(&unknown)).await.is_err());

        let revoked = fx.keys.create("acme", None, None, new_key(None)).await.unwrap();
        fx.keys.revoke("acme", &revoked.record.key_id).await.unwrap();
        let err = fx.resolver.resolve(&bearer(&revoked.key)).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(msg) if msg.contains("revoked")));

        let mut expired = fx.keys.create("acme", None, None, new_key(Some(60))).await.unwrap();
        expired.record.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        fx.keys.store().insert(expired.record.clone()).await.unwrap();
        let err = fx.resolver.resolve(&bearer(&expired.key)).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(msg) if msg.contains("expired")));
    }

    #[tokio::test]
    async fn session_bearer_and_cookie_resolve() {
        let fx = fixture();
        fx.sessions.insert(session("abc-123")).await.unwrap();

        let p = fx.resolver.resolve(&bearer("gwo_session_abc-123")).await.unwrap();
        assert_eq!(p.user_id.as_deref(), Some("bob"));
        assert_eq!(p.permissions, PermissionSource::Roles);

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; gwo_session=abc-123"));
        let p = fx.resolver.resolve(&headers).await.unwrap();
        assert_eq!(p.team_id.as_deref(), Some("platform"));
    }

    #[tokio::test]
    async fn session_activity_is_refreshed_in_background() {
        // GIVEN: a session with stale activity
        let fx = fixture();
        let s = session("s-1");
        let stale = s.last_activity_at;
        fx.sessions.insert(s).await.unwrap();

        // WHEN: it is used
        fx.resolver.resolve(&bearer("gwo_session_s-1")).await.unwrap();

        // THEN: last activity moves forward shortly after
        let mut refreshed = false;
        for _ in 0..50 {
            let now = fx.sessions.get("s-1").await.unwrap().unwrap().last_activity_at;
            if now > stale {
                refreshed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(refreshed);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let fx = fixture();
        let err = fx.resolver.resolve(&bearer("gwo_session_nope")).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }
}
