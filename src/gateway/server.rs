//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::proxy::ProxyForwarder;
use super::router::{AppState, create_router};
use crate::audit::{AuditRecorder, spawn_purger};
use crate::batch::BatchExecutor;
use crate::config::Config;
use crate::identity::{
    IdentityResolver, InMemoryKeyStore, InMemorySessionStore, KeyManager, KeyStore, SessionStore,
    UserSession, spawn_session_reaper,
};
use crate::ratelimit::{self, InMemoryRateLimitStore, RateLimitStore, RateLimiter};
use crate::rbac::{InMemoryRbacStore, PermissionEngine};
use crate::safety::{InMemoryPolicyStore, SafetyDetector};
use crate::tools::{InMemoryToolStore, ToolAccessController, spawn_sweeper};
use crate::{Error, Result};

/// Policy-enforcing MCP gateway
pub struct Gateway {
    config: Arc<Config>,
    state: Arc<AppState>,
    sessions: Arc<dyn SessionStore>,
    rate_store: Arc<dyn RateLimitStore>,
}

impl Gateway {
    /// Build every service over in-memory stores and seed them from
    /// configuration. Must be called within a Tokio runtime.
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let key_store: Arc<dyn KeyStore> = Arc::new(InMemoryKeyStore::new());
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let keys = Arc::new(KeyManager::new(Arc::clone(&key_store), config.auth.key_prefix.clone()));
        for cfg in &config.auth.api_keys {
            keys.seed(cfg).await?;
        }
        for cfg in &config.auth.sessions {
            sessions.insert(UserSession::from_config(cfg)).await?;
        }
        let resolver = Arc::new(IdentityResolver::new(
            key_store,
            Arc::clone(&sessions),
            config.auth.key_prefix.clone(),
            config.auth.session_cookie.clone(),
        ));

        let rbac = Arc::new(PermissionEngine::new(Arc::new(InMemoryRbacStore::new())));
        rbac.seed_builtins().await?;
        rbac.seed(&config.rbac).await?;

        let rate_store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::new());
        let limiter = Arc::new(RateLimiter::new(Arc::clone(&rate_store), &config.rate_limit));

        let safety = Arc::new(SafetyDetector::in_memory(
            Arc::new(InMemoryPolicyStore::new()),
            &config.safety,
        ));
        for seed in &config.safety.policies {
            safety
                .create_policy(&seed.org_id, None, seed.policy.clone())
                .await?;
        }

        let tools = Arc::new(ToolAccessController::new(Arc::new(InMemoryToolStore::new())));
        tools.seed(&config.tools).await?;

        let audit = Arc::new(AuditRecorder::in_memory(&config.audit));
        let proxy = Arc::new(ProxyForwarder::new(&config.servers)?);
        let batch = Arc::new(BatchExecutor::new(
            Arc::clone(&proxy),
            Arc::clone(&tools),
            &config.batch,
        ));

        info!(
            api_keys = config.auth.api_keys.len(),
            sessions = config.auth.sessions.len(),
            policies = config.safety.policies.len(),
            servers = config.servers.len(),
            "Gateway services initialized"
        );

        let state = Arc::new(AppState {
            config: Arc::clone(&config),
            resolver,
            keys,
            rbac,
            limiter,
            safety,
            tools,
            audit,
            proxy,
            batch,
        });
        Ok(Self {
            config,
            state,
            sessions,
            rate_store,
        })
    }

    /// Shared services
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// HTTP router over the shared services
    #[must_use]
    pub fn router(&self) -> axum::Router {
        create_router(Arc::clone(&self.state))
    }

    /// Bind, start background maintenance and serve until Ctrl-C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        ratelimit::spawn_reaper(
            Arc::clone(&self.rate_store),
            self.state.limiter.window_secs(),
            self.config.rate_limit.reap_interval,
            shutdown_tx.subscribe(),
        );
        spawn_session_reaper(
            Arc::clone(&self.sessions),
            self.config.auth.session_reap_interval,
            shutdown_tx.subscribe(),
        );
        spawn_sweeper(
            Arc::clone(&self.state.tools),
            self.config.tools.sweep_interval,
            shutdown_tx.subscribe(),
        );
        spawn_purger(
            Arc::clone(self.state.audit.store()),
            self.config.audit.retention,
            self.config.audit.purge_interval,
            shutdown_tx.subscribe(),
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("MCP POLICY GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            rate_limit = self.state.limiter.is_enabled(),
            safety = self.config.safety.enabled,
            audit = self.state.audit.is_enabled(),
            "Enforcement stages"
        );
        for server in self.state.proxy.servers() {
            info!("  POST /v1/mcp/{server}/{{tools|resources|prompts}}/{{action}}");
        }
        info!("============================================================");

        let mut drain_rx = shutdown_tx.subscribe();
        let drain_timeout = self.config.server.shutdown_timeout;
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .into_future();

        tokio::select! {
            result = server => {
                result.map_err(|e| Error::Internal(e.to_string()))?;
            }
            () = async {
                let _ = drain_rx.recv().await;
                tokio::time::sleep(drain_timeout).await;
            } => {
                warn!(timeout = ?drain_timeout, "Connections still open after shutdown timeout, closing");
            }
        }

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
