//! Process-wide state shared by transfer sessions

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use super::Role;
use crate::config::Config;
use crate::crypto::SecurityEngine;
use crate::error::{Result, TransferError};
use crate::network::NetworkProfiler;
use crate::transport::{RelayTransport, SharedDirTransport, TransferId, TransportManager};

/// Everything a session needs besides its code
///
/// Built once at startup and shared behind an `Arc`. The transport registry
/// is read-only from here on.
pub struct TransferContext {
    config: Config,
    engine: SecurityEngine,
    profiler: NetworkProfiler,
    manager: TransportManager,
    active: Mutex<HashSet<(TransferId, Role)>>,
}

impl TransferContext {
    /// Assemble a context from explicit parts
    pub fn new(config: Config, manager: TransportManager) -> Self {
        TransferContext {
            engine: SecurityEngine::new(config.kdf_context.clone()),
            profiler: NetworkProfiler::new(config.probe_targets()),
            config,
            manager,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the network profiler
    pub fn with_profiler(mut self, profiler: NetworkProfiler) -> Self {
        self.profiler = profiler;
        self
    }

    /// Build the standard context: relay transport, plus the shared-directory
    /// transport when a shared directory is configured. Backends are set up
    /// before this returns.
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let mut manager = TransportManager::from_config(&config);
        manager.register(Arc::new(
            RelayTransport::new(config.relay_url.clone(), config.relay_priority)
                .with_probe_timeout(config.probe_timeout()),
        ));
        if config.shared_dir.is_some() {
            manager.register(Arc::new(SharedDirTransport::new(config.shared_dir_priority)));
        }
        manager.setup_all(&config).await;

        Ok(Arc::new(Self::new(config, manager)))
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Key derivation and encryption
    pub fn engine(&self) -> &SecurityEngine {
        &self.engine
    }

    /// Network classification
    pub fn profiler(&self) -> &NetworkProfiler {
        &self.profiler
    }

    /// Registered transports and failover policy
    pub fn manager(&self) -> &TransportManager {
        &self.manager
    }

    /// Close every backend
    pub async fn shutdown(&self) {
        self.manager.close_all().await;
    }

    /// Claim `(transfer_id, role)` for one session until the guard drops
    pub(crate) fn claim(self: &Arc<Self>, transfer_id: &TransferId, role: Role) -> Result<ActiveTransfer> {
        let key = (transfer_id.clone(), role);
        let mut active = self
            .active
            .lock()
            .map_err(|_| TransferError::InvalidState("active transfer registry poisoned".into()))?;

        if !active.insert(key.clone()) {
            info!("Rejecting second {} session for transfer {}", role, transfer_id);
            return Err(TransferError::TransferInProgress);
        }

        Ok(ActiveTransfer {
            ctx: self.clone(),
            key,
        })
    }
}

/// Registry claim released on drop
pub(crate) struct ActiveTransfer {
    ctx: Arc<TransferContext>,
    key: (TransferId, Role),
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        if let Ok(mut active) = self.ctx.active.lock() {
            active.remove(&self.key);
        }
    }
}
