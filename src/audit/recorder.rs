//! Fire-and-forget audit writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::event::AuditLog;
use super::store::{AuditSink, AuditStore};
use crate::config::AuditConfig;
use crate::worker::WorkerQueue;

/// Hands audit records to a background writer and serves reads from the
/// in-memory store.
pub struct AuditRecorder {
    enabled: bool,
    queue: WorkerQueue<AuditLog>,
    store: Arc<AuditStore>,
}

impl AuditRecorder {
    /// Create a recorder writing to `sink`. Must be called within a Tokio
    /// runtime.
    pub fn new(store: Arc<AuditStore>, sink: Arc<dyn AuditSink>, config: &AuditConfig) -> Self {
        let queue = WorkerQueue::spawn("audit", config.queue_capacity, move |entry: AuditLog| {
            let sink = Arc::clone(&sink);
            async move {
                match serde_json::to_string(&entry) {
                    Ok(json) => info!(audit = %json, "Audit event"),
                    Err(e) => warn!(error = %e, "Failed to encode audit event"),
                }
                let id = entry.id.clone();
                if let Err(e) = sink.append(entry).await {
                    warn!(audit_id = %id, error = %e, "Failed to write audit event");
                }
            }
        });
        Self {
            enabled: config.enabled,
            queue,
            store,
        }
    }

    /// Recorder writing into its own in-memory store
    pub fn in_memory(config: &AuditConfig) -> Self {
        let store = Arc::new(AuditStore::new(config.capacity));
        Self::new(Arc::clone(&store), store as Arc<dyn AuditSink>, config)
    }

    /// Whether requests are audited at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queue `entry` for writing. Never waits; returns `false` if dropped.
    pub fn record(&self, entry: AuditLog) -> bool {
        if !self.enabled {
            return false;
        }
        self.queue.dispatch(entry)
    }

    /// Read side
    #[must_use]
    pub fn store(&self) -> &Arc<AuditStore> {
        &self.store
    }
}

/// Spawn the retention purge.
pub fn spawn_purger(
    store: Arc<AuditStore>,
    retention: Duration,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Ok(retention) = chrono::Duration::from_std(retention) else {
                        warn!("Audit retention out of range, purge disabled");
                        break;
                    };
                    let purged = store.purge_before(Utc::now() - retention);
                    if purged > 0 {
                        info!(count = purged, "Purged expired audit records");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Audit purge shutting down");
                    break;
                }
            }
        }
    });
}
