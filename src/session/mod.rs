//! Transfer sessions
//!
//! A [`TransferSession`] ties one transfer code to one send or receive
//! operation. It derives the key, classifies the network, picks the
//! encryption mode, lets the [`TransportManager`](crate::transport::TransportManager)
//! fail over between backends, and verifies what arrives.
//!
//! Both peers reach the same key and mode without talking to each other:
//! the key comes from the code, and the mode comes from a fixed table over
//! the payload size and the sender's network type, which travels in the
//! metadata.

mod code;
mod context;
mod events;
mod state;

pub use code::{TransferCode, CODE_WORDS};
pub use context::TransferContext;
pub use events::{EventSink, SessionEvent, EVENT_CAPACITY};
pub use state::{Role, SessionState};

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crypto::{DerivedKey, EncryptionMode, Hash, IntegrityLevel};
use crate::error::{Result, TransferError};
use crate::network::NetworkType;
use crate::transport::{
    AttemptLog, AttemptRecord, Envelope, FailoverObserver, TransferId, TransferMetadata,
};

/// Cancels a running session from anywhere
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Point-in-time copy of a session's observable fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Sender or receiver
    pub role: Role,
    /// Current state
    pub state: SessionState,
    /// Rendezvous identifier
    pub transfer_id: TransferId,
    /// Backend of the latest attempt
    pub selected_transport: Option<String>,
    /// Encryption mode, once known
    pub selected_mode: Option<EncryptionMode>,
    /// Every transport attempt so far
    pub attempts: Vec<AttemptRecord>,
}

/// Outcome of a successful send
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReport {
    /// Backend that delivered the envelope
    pub transport: String,
    /// Encryption mode used
    pub mode: EncryptionMode,
    /// Network classification recorded in the metadata
    pub network: NetworkType,
    /// Metadata as sent
    pub metadata: TransferMetadata,
    /// Ciphertext size on the wire
    pub ciphertext_len: usize,
}

/// A verified, decrypted file
#[derive(Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Metadata from the sender
    pub metadata: TransferMetadata,
    /// Plaintext
    pub data: Vec<u8>,
    /// Backend that delivered it
    pub transport: String,
    /// Mode it was decrypted with
    pub mode: EncryptionMode,
    /// How much the ciphertext proved
    pub integrity: IntegrityLevel,
}

impl ReceivedFile {
    /// Write the file into `dir` under the sender's file name, reduced to its
    /// last path component. Returns the path written.
    pub async fn save_into(&self, dir: &Path) -> Result<PathBuf> {
        let name = safe_file_name(&self.metadata.file_name)
            .ok_or_else(|| TransferError::InvalidState(format!(
                "refusing to write file named {:?}",
                self.metadata.file_name
            )))?;

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

impl std::fmt::Debug for ReceivedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedFile")
            .field("metadata", &self.metadata)
            .field("data", &format_args!("[{} bytes]", self.data.len()))
            .field("transport", &self.transport)
            .field("mode", &self.mode)
            .field("integrity", &self.integrity)
            .finish()
    }
}

fn safe_file_name(name: &str) -> Option<&str> {
    match Path::new(name).components().last()? {
        Component::Normal(last) => last.to_str(),
        _ => None,
    }
}

struct Progress {
    state: SessionState,
    selected_transport: Option<String>,
    selected_mode: Option<EncryptionMode>,
}

/// State shared between the session and its failover observer
struct Shared {
    role: Role,
    transfer_id: TransferId,
    progress: Mutex<Progress>,
    log: AttemptLog,
    events: EventSink,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.progress
            .lock()
            .map(|p| p.state)
            .unwrap_or(SessionState::Failed)
    }

    fn transition(&self, next: SessionState, phase: impl Into<String>) -> Result<()> {
        {
            let mut progress = self
                .progress
                .lock()
                .map_err(|_| TransferError::InvalidState("session state poisoned".into()))?;
            if !progress.state.can_transition_to(next) {
                return Err(TransferError::InvalidState(format!(
                    "cannot go from {} to {}",
                    progress.state, next
                )));
            }
            progress.state = next;
        }

        let phase = phase.into();
        info!("[{} {}] {}: {}", self.role, self.transfer_id, next, phase);
        self.events.emit(SessionEvent::Status { state: next, phase });
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut Progress)) {
        if let Ok(mut progress) = self.progress.lock() {
            apply(&mut progress);
        }
    }

    fn progress(&self, bytes_transferred: u64, total_bytes: u64, file_name: &str) {
        self.events.emit(SessionEvent::Progress {
            bytes_transferred,
            total_bytes,
            file_name: file_name.to_string(),
        });
    }

    /// Move to the terminal state matching `result`
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            let (next, phase) = if e.is_cancellation() {
                (SessionState::Cancelled, "cancelled by caller".to_string())
            } else {
                (SessionState::Failed, e.to_string())
            };
            if let Err(err) = self.transition(next, phase) {
                warn!("Could not record session end: {}", err);
            }
        }
        result
    }
}

impl FailoverObserver for Shared {
    fn attempt_started(&self, transport: &str, attempt: usize, total: usize) {
        self.update(|p| p.selected_transport = Some(transport.to_string()));
        let phase = format!("trying {} ({}/{})", transport, attempt, total);
        if let Err(e) = self.transition(SessionState::Transporting, phase) {
            warn!("{}", e);
        }
    }
}

/// One send or receive operation bound to a transfer code
pub struct TransferSession {
    ctx: Arc<TransferContext>,
    code: TransferCode,
    shared: Shared,
    cancel: CancellationToken,
}

impl TransferSession {
    /// Session that will send a file under `code`
    pub fn sender(ctx: Arc<TransferContext>, code: TransferCode) -> Self {
        Self::new(ctx, code, Role::Sender)
    }

    /// Session that will receive the file sent under `code`
    pub fn receiver(ctx: Arc<TransferContext>, code: TransferCode) -> Self {
        Self::new(ctx, code, Role::Receiver)
    }

    fn new(ctx: Arc<TransferContext>, code: TransferCode, role: Role) -> Self {
        let shared = Shared {
            role,
            transfer_id: code.transfer_id(),
            progress: Mutex::new(Progress {
                state: SessionState::Idle,
                selected_transport: None,
                selected_mode: None,
            }),
            log: AttemptLog::new(),
            events: EventSink::new(),
        };

        TransferSession {
            ctx,
            code,
            shared,
            cancel: CancellationToken::new(),
        }
    }

    /// Sender or receiver
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Rendezvous identifier derived from the code
    pub fn transfer_id(&self) -> &TransferId {
        &self.shared.transfer_id
    }

    /// The transfer code
    pub fn code(&self) -> &TransferCode {
        &self.code
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Handle that cancels this session
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    /// Subscribe to status and progress events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Copy of the observable session fields
    pub fn snapshot(&self) -> SessionSnapshot {
        let (state, selected_transport, selected_mode) = self
            .shared
            .progress
            .lock()
            .map(|p| (p.state, p.selected_transport.clone(), p.selected_mode))
            .unwrap_or((SessionState::Failed, None, None));

        SessionSnapshot {
            role: self.shared.role,
            state,
            transfer_id: self.shared.transfer_id.clone(),
            selected_transport,
            selected_mode,
            attempts: self.shared.log.records(),
        }
    }

    /// Encrypt `data` and deliver it to the receiver holding the same code
    pub async fn send(&self, file_name: &str, data: &[u8]) -> Result<SendReport> {
        self.expect_role(Role::Sender)?;
        let _claim = self.ctx.claim(&self.shared.transfer_id, Role::Sender)?;
        let result = self.run_send(file_name, data).await;
        self.shared.settle(result)
    }

    /// Wait for the sender's file, then decrypt and verify it
    pub async fn receive(&self) -> Result<ReceivedFile> {
        self.expect_role(Role::Receiver)?;
        let _claim = self.ctx.claim(&self.shared.transfer_id, Role::Receiver)?;
        let result = self.run_receive().await;
        self.shared.settle(result)
    }

    fn expect_role(&self, role: Role) -> Result<()> {
        if self.shared.role != role {
            return Err(TransferError::InvalidState(format!(
                "this session is a {}",
                self.shared.role
            )));
        }
        if self.state() != SessionState::Idle {
            return Err(TransferError::InvalidState(format!(
                "session already {}",
                self.state()
            )));
        }
        Ok(())
    }

    async fn run_send(&self, file_name: &str, data: &[u8]) -> Result<SendReport> {
        let key = self.derive_key().await?;

        self.shared
            .transition(SessionState::Negotiating, "probing network")?;
        let profile = self
            .cancellable(self.ctx.profiler().classify(self.ctx.config().probe_timeout()))
            .await?;
        let network = profile.network_type;

        let engine = self.ctx.engine();
        let mode = engine.select_mode(data.len() as u64, network);
        self.shared.update(|p| p.selected_mode = Some(mode));
        info!("Sending {} bytes with {} on a {} network", data.len(), mode, network);

        let metadata =
            TransferMetadata::describe(self.shared.transfer_id.clone(), file_name, data, network);
        let ciphertext = engine.encrypt(data, &key, mode, &metadata.aad())?;
        let envelope = Envelope {
            metadata,
            ciphertext,
        };

        let manager = self.ctx.manager();
        let order = manager
            .select_order(&profile, envelope.ciphertext.len() as u64, &self.cancel)
            .await;
        self.shared
            .progress(0, envelope.metadata.file_size, &envelope.metadata.file_name);

        let transport = manager
            .send_with_failover(
                &order,
                &envelope,
                &self.shared.log,
                &self.shared,
                &self.cancel,
            )
            .await?;

        self.shared
            .transition(SessionState::Verifying, format!("delivered over {}", transport))?;
        self.shared.progress(
            envelope.metadata.file_size,
            envelope.metadata.file_size,
            &envelope.metadata.file_name,
        );
        self.shared
            .transition(SessionState::Completed, "receiver acknowledged")?;

        Ok(SendReport {
            transport,
            mode,
            network,
            ciphertext_len: envelope.ciphertext.len(),
            metadata: envelope.metadata,
        })
    }

    async fn run_receive(&self) -> Result<ReceivedFile> {
        let key = self.derive_key().await?;

        self.shared
            .transition(SessionState::Negotiating, "probing network")?;
        let profile = self
            .cancellable(self.ctx.profiler().classify(self.ctx.config().probe_timeout()))
            .await?;

        let manager = self.ctx.manager();
        let order = manager.select_order(&profile, 0, &self.cancel).await;
        let (transport, envelope) = manager
            .receive_with_failover(
                &order,
                &self.shared.transfer_id,
                &self.shared.log,
                &self.shared,
                &self.cancel,
            )
            .await?;

        // From here on the payload is ours; cancellation no longer applies
        let metadata = envelope.metadata;
        self.shared.transition(
            SessionState::Verifying,
            format!("{} received over {}", metadata.file_name, transport),
        )?;

        let engine = self.ctx.engine();
        let mode = engine.select_mode(metadata.file_size, metadata.network_hint);
        self.shared.update(|p| p.selected_mode = Some(mode));

        let integrity = engine.verify_integrity(mode, &envelope.ciphertext)?;
        let data = engine.decrypt(&envelope.ciphertext, &key, mode, &metadata.aad())?;

        if data.len() as u64 != metadata.file_size || !Hash::verify_hex(&data, &metadata.digest) {
            return Err(TransferError::Integrity(
                "plaintext does not match the sender's digest".into(),
            ));
        }

        self.shared
            .progress(metadata.file_size, metadata.file_size, &metadata.file_name);
        self.shared
            .transition(SessionState::Completed, format!("verified with {}", mode))?;

        Ok(ReceivedFile {
            metadata,
            data,
            transport,
            mode,
            integrity,
        })
    }

    /// Stretch the code on the blocking pool
    async fn derive_key(&self) -> Result<DerivedKey> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let engine = self.ctx.engine().clone();
        let code = self.code.clone();
        let derivation =
            tokio::task::spawn_blocking(move || engine.strengthen_code(code.as_str()));

        let key = self
            .cancellable(derivation)
            .await?
            .map_err(|e| TransferError::InvalidState(format!("key derivation task failed: {}", e)))??;

        self.shared
            .transition(SessionState::CodeReady, "key derived")?;
        Ok(key)
    }

    async fn cancellable<T>(&self, work: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            value = work => Ok(value),
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
