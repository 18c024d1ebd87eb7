//! Lifecycle owner for the local side: admission control, stream opening,
//! and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use cipher_relay_cipher::MasterKey;
use cipher_relay_peer::{ConnectionManager, Destination, StreamHandle};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::LocalConfig;
use crate::error::{LocalError, Result};
use crate::registry::{ConnectionRegistry, StatsSnapshot};

/// Time allowed for tasks to notice forcibly closed connections.
const FORCED_CLOSE_WAIT: Duration = Duration::from_millis(500);

/// Slot under the concurrent stream cap, released on drop.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

/// Owns the connection pool and every task serving clients.
pub struct Supervisor {
    manager: ConnectionManager,
    admission: Arc<Semaphore>,
    max_streams: usize,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new(config: &LocalConfig, key: Arc<MasterKey>) -> Self {
        Self {
            manager: ConnectionManager::new(config.connector(), key),
            admission: Arc::new(Semaphore::new(config.max_streams)),
            max_streams: config.max_streams,
            registry: ConnectionRegistry::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Claim a slot for a new client connection, failing at once if the
    /// cap is reached.
    pub fn try_admit(&self) -> Result<Admission> {
        if self.shutdown.is_cancelled() {
            return Err(LocalError::ShuttingDown);
        }
        self.admission
            .clone()
            .try_acquire_owned()
            .map(|permit| Admission { _permit: permit })
            .map_err(|_| LocalError::AdmissionRejected {
                limit: self.max_streams,
            })
    }

    /// Open a logical stream to `destination` on a pooled connection.
    ///
    /// If the chosen connection dies during the open, the request is retried
    /// once on a fresh connection.
    pub async fn open_relayed_stream(&self, destination: Destination) -> Result<StreamHandle> {
        if self.shutdown.is_cancelled() {
            return Err(LocalError::ShuttingDown);
        }
        let conn = self.manager.get_or_create().await?;
        match conn.open_stream(destination.clone()).await {
            Ok(stream) => Ok(stream),
            Err(err) if err.is_retryable() && conn.is_closed() => {
                warn!(
                    connection_id = conn.id(),
                    %destination,
                    error = %err,
                    "transport connection lost during open, retrying"
                );
                let conn = self.manager.get_or_create().await?;
                Ok(conn.open_stream(destination).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Registry totals plus transport-level counters.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.registry.snapshot();
        let wire = self.manager.wire_counters();
        snapshot.wire_sent_bytes = wire.sent();
        snapshot.wire_received_bytes = wire.received();
        snapshot.transport_connections = self.manager.connection_count();
        snapshot.active_streams = self.manager.active_streams();
        snapshot
    }

    /// Stop accepting, let in-flight relays drain for up to `grace`, then
    /// close every transport connection.
    pub async fn shutdown(&self, grace: Duration) -> StatsSnapshot {
        info!(?grace, "shutting down local relay");
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "shutdown grace expired, closing transport connections"
            );
        }
        self.manager.close_all();
        if tokio::time::timeout(FORCED_CLOSE_WAIT, self.tracker.wait())
            .await
            .is_err()
        {
            debug!(remaining = self.tracker.len(), "tasks still winding down");
        }

        let stats = self.stats();
        info!(
            total_connections = stats.total_connections,
            upload_bytes = stats.upload_bytes,
            download_bytes = stats.download_bytes,
            "local relay stopped"
        );
        stats
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("manager", &self.manager)
            .field("max_streams", &self.max_streams)
            .field("available", &self.admission.available_permits())
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}
