//! # Passage
//!
//! Two-party file transfer keyed by a short human-readable code.
//!
//! ## Features
//!
//! - **Code-derived keys**: the transfer code is stretched into a 32-byte key
//!   on both sides, so no secret ever crosses the wire
//! - **Deterministic mode choice** from payload size and network type
//! - **Pluggable transports** with ranking and automatic failover
//!   (WebSocket relay, shared directory, in-memory)
//! - **Network profiling** to spot restrictive, institutional and mobile networks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use passage::{Config, TransferCode, TransferContext, TransferSession};
//!
//! # async fn run() -> passage::Result<()> {
//! let ctx = TransferContext::from_config(Config::load_with_env()?).await?;
//!
//! // Share this code with the receiver
//! let code = TransferCode::generate();
//! println!("Code: {}", code.as_str());
//!
//! let session = TransferSession::sender(ctx, code);
//! let report = session.send("notes.txt", b"see you at nine").await?;
//! println!("Sent over {} using {}", report.transport, report.mode);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              APPLICATION LAYER              │
//! │        passage CLI  |  passage-relay        │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               SESSION LAYER                 │
//! │  TransferSession | events | cancellation    │
//! └──────────┬──────────────────────┬───────────┘
//!            │                      │
//! ┌──────────▼──────────┐ ┌─────────▼───────────┐
//! │    CRYPTO LAYER     │ │   NETWORK PROFILER  │
//! │  PBKDF2 | AEAD modes│ │  TCP probes | proxy │
//! └──────────┬──────────┘ └─────────┬───────────┘
//!            │                      │
//! ┌──────────▼──────────────────────▼───────────┐
//! │             TRANSPORT LAYER                 │
//! │  Manager (rank, failover) | Relay | Dir     │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod session;
pub mod transport;

// Re-export main types at crate root
pub use config::Config;
pub use crypto::{CryptoError, EncryptionMode, SecurityEngine};
pub use error::{Result, TransferError};
pub use network::{NetworkProfile, NetworkProfiler, NetworkType};
pub use session::{
    CancelHandle, ReceivedFile, Role, SendReport, SessionEvent, SessionSnapshot, SessionState,
    TransferCode, TransferContext, TransferSession,
};
pub use transport::{Transport, TransportError, TransportManager};
