//! Transport layer abstraction
//!
//! Backends move an [`Envelope`] from the sender to the receiver and nothing
//! else: encryption happens before a backend ever sees the payload. The
//! [`TransportManager`] ranks the registered backends and fails over between
//! them.
//!
//! Shipped backends:
//! - [`memory`]: in-process rendezvous hub (testing, embedding)
//! - [`relay`]: WebSocket relay server, rooms keyed by transfer ID
//! - [`shared_dir`]: a directory both peers can reach, with a readiness marker

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

pub mod envelope;
pub mod manager;
pub mod memory;
pub mod relay;
pub mod shared_dir;

pub use envelope::{Envelope, TransferId, TransferMetadata};
pub use manager::{
    AttemptLog, AttemptOutcome, AttemptRecord, FailoverObserver, RankedTransport,
    TransportManager,
};
pub use memory::{MemoryHub, MemoryTransport};
pub use relay::RelayTransport;
pub use shared_dir::SharedDirTransport;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Backend cannot be used right now (not configured, not reachable)
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The operation observed its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Local IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Capability contract every backend implements
///
/// Backends are shared between sessions behind an `Arc`, so every method
/// takes `&self`. `send` and `receive` must be safe to retry and must return
/// promptly once their cancellation token fires. `close` must be safe even
/// if `setup` never ran or failed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Prepare the backend from configuration
    async fn setup(&self, config: &Config) -> TransportResult<()>;

    /// Deliver an envelope to the peer waiting on the same transfer ID
    async fn send(&self, envelope: &Envelope, cancel: &CancellationToken) -> TransportResult<()>;

    /// Wait for the envelope published under `transfer_id`
    async fn receive(
        &self,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> TransportResult<Envelope>;

    /// Quick liveness probe; must itself honour cancellation
    async fn is_available(&self, cancel: &CancellationToken) -> bool;

    /// Ranking priority, lower values are tried first
    fn priority(&self) -> i32;

    /// Stable backend name for logs and attempt records
    fn name(&self) -> &str;

    /// Release resources
    async fn close(&self) -> TransportResult<()>;
}
