//! Shared-directory transport
//!
//! For peers that can both see one directory (network mount, synced folder).
//! The sender writes `<id>.envelope` and then the readiness marker
//! `<id>.ready`; the receiver polls for the marker, takes the envelope and
//! removes both files. The sender reports success once the marker is gone.
//! The marker's contents are never interpreted.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Envelope, TransferId, Transport, TransportError, TransportResult};
use crate::config::Config;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Transport through a directory both peers can access
pub struct SharedDirTransport {
    dir: RwLock<Option<PathBuf>>,
    priority: i32,
    poll_interval: Duration,
}

impl SharedDirTransport {
    /// Create an unconfigured transport; `setup` supplies the directory
    pub fn new(priority: i32) -> Self {
        SharedDirTransport {
            dir: RwLock::new(None),
            priority,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Create a transport for a known directory
    pub fn with_dir(dir: impl Into<PathBuf>, priority: i32) -> Self {
        let transport = Self::new(priority);
        if let Ok(mut slot) = transport.dir.write() {
            *slot = Some(dir.into());
        }
        transport
    }

    /// How often the receiver looks for the marker
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn dir(&self) -> TransportResult<PathBuf> {
        self.dir
            .read()
            .ok()
            .and_then(|dir| dir.clone())
            .ok_or_else(|| TransportError::Unavailable("no shared directory configured".into()))
    }

    fn paths(dir: &Path, id: &TransferId) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{}.envelope", id)),
            dir.join(format!("{}.ready", id)),
        )
    }

    async fn publish(&self, dir: &Path, envelope: &Envelope) -> TransportResult<PathBuf> {
        let (envelope_path, marker_path) = Self::paths(dir, &envelope.metadata.transfer_id);
        let staging = envelope_path.with_extension("envelope.partial");

        tokio::fs::write(&staging, envelope.to_bytes()?).await?;
        tokio::fs::rename(&staging, &envelope_path).await?;
        tokio::fs::write(&marker_path, b"ready\n").await?;
        Ok(marker_path)
    }

    async fn take(dir: &Path, id: &TransferId) -> TransportResult<Envelope> {
        let (envelope_path, marker_path) = Self::paths(dir, id);

        let bytes = tokio::fs::read(&envelope_path).await?;
        let envelope = Envelope::from_bytes(&bytes)?;
        if &envelope.metadata.transfer_id != id {
            return Err(TransportError::InvalidData("Envelope for another transfer".to_string()));
        }

        tokio::fs::remove_file(&envelope_path).await?;
        tokio::fs::remove_file(&marker_path).await?;
        Ok(envelope)
    }

    async fn withdraw(dir: &Path, id: &TransferId) {
        let (envelope_path, marker_path) = Self::paths(dir, id);
        for path in [marker_path, envelope_path] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SharedDirTransport {
    async fn setup(&self, config: &Config) -> TransportResult<()> {
        let Some(dir) = config.shared_dir.clone() else {
            return Ok(());
        };
        let mut slot = self
            .dir
            .write()
            .map_err(|_| TransportError::Unavailable("shared dir state poisoned".into()))?;
        *slot = Some(dir);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope, cancel: &CancellationToken) -> TransportResult<()> {
        let dir = self.dir()?;
        let id = &envelope.metadata.transfer_id;

        let marker = match self.publish(&dir, envelope).await {
            Ok(marker) => marker,
            Err(e) => {
                Self::withdraw(&dir, id).await;
                return Err(e);
            }
        };
        debug!("Published {} in {}", id, dir.display());

        // The receiver removes the marker once it holds the envelope
        loop {
            if !tokio::fs::try_exists(&marker).await.unwrap_or(true) {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    Self::withdraw(&dir, id).await;
                    return Err(TransportError::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn receive(
        &self,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> TransportResult<Envelope> {
        let dir = self.dir()?;
        let (_, marker) = Self::paths(&dir, transfer_id);

        loop {
            if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                return Self::take(&dir, transfer_id).await;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn is_available(&self, _cancel: &CancellationToken) -> bool {
        let Ok(dir) = self.dir() else {
            return false;
        };
        match tokio::fs::metadata(&dir).await {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "shared-dir"
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}
