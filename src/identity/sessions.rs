//! User sessions.
//!
//! Sessions are created by the login flow (outside this crate) and looked up
//! here by id. Expired sessions are evicted lazily on access and by
//! [`spawn_reaper`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SessionConfig;
use crate::Result;

/// An authenticated user session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    /// Session id (UUID)
    pub id: String,
    /// User
    pub user_id: String,
    /// Organization
    pub org_id: String,
    /// Team
    pub team_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Last request seen on this session
    pub last_activity_at: DateTime<Utc>,
    /// Client IP at login
    pub ip_address: Option<String>,
    /// Client user agent at login
    pub user_agent: Option<String>,
}

impl UserSession {
    /// Whether the session has passed its expiry
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Build a session from configuration, expiring `ttl` from now
    #[must_use]
    pub fn from_config(cfg: &SessionConfig) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(cfg.ttl).unwrap_or(chrono::Duration::hours(24));
        Self {
            id: cfg.id.clone(),
            user_id: cfg.user_id.clone(),
            org_id: cfg.org_id.clone(),
            team_id: cfg.team_id.clone(),
            created_at: now,
            expires_at: now + ttl,
            last_activity_at: now,
            ip_address: None,
            user_agent: None,
        }
    }
}

/// Storage backend for sessions.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert or replace a session
    async fn insert(&self, session: UserSession) -> Result<()>;

    /// Look up a live session. Expired sessions yield `None`.
    async fn get(&self, id: &str) -> Result<Option<UserSession>>;

    /// Record activity on a session
    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Remove a session (logout). Returns `true` if it existed.
    async fn remove(&self, id: &str) -> Result<bool>;

    /// Remove all expired sessions
    async fn reap_expired(&self) -> usize;
}

/// In-memory session store backed by a `DashMap`
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, UserSession>,
}

impl InMemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: UserSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserSession>> {
        let Some(session) = self.sessions.get(id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        if session.is_expired(Utc::now()) {
            self.sessions.remove(id);
            debug!(session = %id, "Lazy-evicted expired session");
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            if at > entry.last_activity_at {
                entry.last_activity_at = at;
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        before - self.sessions.len()
    }
}

/// Spawn a background task that reaps expired sessions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired sessions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    });
}
