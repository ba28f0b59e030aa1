//! End-to-end sessions over in-process transports

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use passage::crypto::IntegrityLevel;
use passage::network::NetworkProfiler;
use passage::transport::{
    AttemptOutcome, Envelope, MemoryHub, MemoryTransport, SharedDirTransport, TransferId,
    TransportResult,
};
use passage::{
    Config, SessionEvent, SessionState, TransferCode, TransferContext, TransferError,
    TransferSession, Transport, TransportError, TransportManager,
};
use tokio_util::sync::CancellationToken;

/// Backend that answers its probe but refuses every transfer
struct Refusing {
    name: &'static str,
    priority: i32,
}

impl Refusing {
    fn new(name: &'static str, priority: i32) -> Arc<Self> {
        Arc::new(Refusing { name, priority })
    }
}

#[async_trait]
impl Transport for Refusing {
    async fn setup(&self, _config: &Config) -> TransportResult<()> {
        Ok(())
    }

    async fn send(&self, _envelope: &Envelope, _cancel: &CancellationToken) -> TransportResult<()> {
        Err(TransportError::ConnectionFailed("refused".into()))
    }

    async fn receive(
        &self,
        _transfer_id: &TransferId,
        _cancel: &CancellationToken,
    ) -> TransportResult<Envelope> {
        Err(TransportError::ConnectionFailed("refused".into()))
    }

    async fn is_available(&self, _cancel: &CancellationToken) -> bool {
        true
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        self.name
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

/// Backend that alters each envelope before passing it to the memory hub
struct Tampering {
    inner: MemoryTransport,
    alter: fn(&mut Envelope),
}

#[async_trait]
impl Transport for Tampering {
    async fn setup(&self, config: &Config) -> TransportResult<()> {
        self.inner.setup(config).await
    }

    async fn send(&self, envelope: &Envelope, cancel: &CancellationToken) -> TransportResult<()> {
        let mut altered = envelope.clone();
        (self.alter)(&mut altered);
        self.inner.send(&altered, cancel).await
    }

    async fn receive(
        &self,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> TransportResult<Envelope> {
        self.inner.receive(transfer_id, cancel).await
    }

    async fn is_available(&self, cancel: &CancellationToken) -> bool {
        self.inner.is_available(cancel).await
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }
}

fn config() -> Config {
    Config {
        attempt_timeout_secs: 5,
        max_failover_secs: 20,
        probe_timeout_ms: 100,
        ..Config::default()
    }
}

/// Context with no probe targets, so profiling returns at once
fn context(manager: TransportManager) -> Arc<TransferContext> {
    Arc::new(TransferContext::new(config(), manager).with_profiler(NetworkProfiler::new(Vec::new())))
}

fn memory_context(hub: &MemoryHub) -> Arc<TransferContext> {
    context(
        TransportManager::from_config(&config())
            .with_transport(Arc::new(MemoryTransport::new("memory", 10, hub.clone()))),
    )
}

#[tokio::test]
async fn test_file_arrives_intact() {
    let hub = MemoryHub::new();
    let code = TransferCode::generate();
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

    let sender = TransferSession::sender(memory_context(&hub), code.clone());
    let receiver = TransferSession::receiver(memory_context(&hub), TransferCode::parse(code.as_str()));
    let mut events = receiver.subscribe();

    let (sent, received) = tokio::join!(sender.send("data.bin", &payload), receiver.receive());
    let report = sent.unwrap();
    let file = received.unwrap();

    assert_eq!(file.data, payload);
    assert_eq!(file.metadata.file_name, "data.bin");
    assert_eq!(file.mode, report.mode);
    assert_eq!(file.integrity, IntegrityLevel::Authenticated);
    assert_eq!(report.transport, "memory");

    for session in [&sender, &receiver] {
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, SessionState::Completed);
        assert_eq!(snapshot.selected_mode, Some(report.mode));
        assert_eq!(snapshot.selected_transport.as_deref(), Some("memory"));
    }

    // Receiver walked the whole lifecycle in order
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Status { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        [
            SessionState::CodeReady,
            SessionState::Negotiating,
            SessionState::Transporting,
            SessionState::Verifying,
            SessionState::Completed,
        ]
    );
}

#[tokio::test]
async fn test_fails_over_to_next_transport() {
    let hub = MemoryHub::new();
    let sender_ctx = context(
        TransportManager::from_config(&config())
            .with_transport(Refusing::new("dead", 1))
            .with_transport(Arc::new(MemoryTransport::new("memory", 10, hub.clone()))),
    );
    let code = TransferCode::parse("amber-falcon-river");
    let sender = TransferSession::sender(sender_ctx, code.clone());
    let receiver = TransferSession::receiver(memory_context(&hub), code);

    let (sent, received) = tokio::join!(sender.send("notes.txt", b"meet at nine"), receiver.receive());
    let report = sent.unwrap();
    assert_eq!(received.unwrap().data, b"meet at nine");
    assert_eq!(report.transport, "memory");

    let attempts = sender.snapshot().attempts;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].transport, "dead");
    assert!(matches!(attempts[0].outcome, AttemptOutcome::Failed(_)));
    assert_eq!(attempts[1].outcome, AttemptOutcome::Succeeded);
}

#[tokio::test]
async fn test_shared_directory_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let shared_dir = |dir: &std::path::Path| {
        context(TransportManager::from_config(&config()).with_transport(Arc::new(
            SharedDirTransport::with_dir(dir, 50).with_poll_interval(Duration::from_millis(20)),
        )))
    };

    let code = TransferCode::parse("cedar lantern quartz");
    let sender = TransferSession::sender(shared_dir(dir.path()), code.clone());
    let receiver = TransferSession::receiver(shared_dir(dir.path()), code);

    let (sent, received) = tokio::join!(sender.send("plan.md", b"# Plan\n"), receiver.receive());
    assert_eq!(sent.unwrap().transport, "shared-dir");
    assert_eq!(received.unwrap().data, b"# Plan\n");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_wrong_code_never_meets() {
    let hub = MemoryHub::new();
    let sender = TransferSession::sender(memory_context(&hub), TransferCode::parse("amber-falcon-river"));
    let receiver =
        TransferSession::receiver(memory_context(&hub), TransferCode::parse("amber-falcon-rivet"));

    // Different codes mean different rendezvous IDs
    assert_ne!(sender.transfer_id(), receiver.transfer_id());

    let receiver_cancel = receiver.cancel_handle();
    let sender_cancel = sender.cancel_handle();
    let stop = async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        receiver_cancel.cancel();
        sender_cancel.cancel();
    };

    let (sent, received, ()) = tokio::join!(sender.send("a.txt", b"secret"), receiver.receive(), stop);
    assert!(matches!(sent, Err(TransferError::Cancelled)));
    assert!(matches!(received, Err(TransferError::Cancelled)));
    assert_eq!(sender.state(), SessionState::Cancelled);
}

#[tokio::test]
async fn test_weak_code_is_rejected_before_any_attempt() {
    let hub = MemoryHub::new();
    let session = TransferSession::sender(memory_context(&hub), TransferCode::parse("abc"));

    let err = session.send("a.txt", b"data").await.unwrap_err();

    assert!(matches!(err, TransferError::WeakCode { length: 3, .. }));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Failed);
    assert!(snapshot.attempts.is_empty());
    assert_eq!(snapshot.selected_transport, None);
}

#[tokio::test]
async fn test_second_session_for_same_code_is_rejected() {
    let hub = MemoryHub::new();
    let ctx = memory_context(&hub);
    let code = TransferCode::parse("amber-falcon-river");

    let first = TransferSession::sender(ctx.clone(), code.clone());
    let second = TransferSession::sender(ctx.clone(), code.clone());
    let mut first_events = first.subscribe();
    let first_cancel = first.cancel_handle();

    let run_second = async {
        // Wait until the first session is transporting
        while let Ok(event) = first_events.recv().await {
            if let SessionEvent::Status { state: SessionState::Transporting, .. } = event {
                break;
            }
        }
        let result = second.send("b.txt", b"two").await;
        first_cancel.cancel();
        result
    };

    let (first_result, second_result) = tokio::join!(first.send("a.txt", b"one"), run_second);

    assert!(matches!(second_result, Err(TransferError::TransferInProgress)));
    assert!(matches!(first_result, Err(TransferError::Cancelled)));

    // Claim is released once the first session ends
    let third = TransferSession::sender(ctx.clone(), code.clone());
    let receiver = TransferSession::receiver(ctx, code);
    let (sent, received) = tokio::join!(third.send("c.txt", b"three"), receiver.receive());
    sent.unwrap();
    assert_eq!(received.unwrap().data, b"three");
}

#[tokio::test]
async fn test_exhaustion_fails_session_with_full_log() {
    let ctx = context(
        TransportManager::from_config(&config())
            .with_transport(Refusing::new("a", 1))
            .with_transport(Refusing::new("b", 2)),
    );
    let session = TransferSession::sender(ctx, TransferCode::parse("amber-falcon-river"));

    match session.send("a.txt", b"data").await {
        Err(TransferError::AllTransportsExhausted { attempts }) => {
            let names: Vec<&str> = attempts.iter().map(|a| a.transport.as_str()).collect();
            assert_eq!(names, ["a", "b"]);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.snapshot().attempts.len(), 2);
}

async fn receive_altered(alter: fn(&mut Envelope)) {
    let hub = MemoryHub::new();
    let sender_ctx = context(TransportManager::from_config(&config()).with_transport(Arc::new(
        Tampering {
            inner: MemoryTransport::new("memory", 10, hub.clone()),
            alter,
        },
    )));
    let receiver_ctx = context(
        TransportManager::from_config(&config())
            .with_transport(Arc::new(MemoryTransport::new("memory", 10, hub.clone())))
            .with_transport(Refusing::new("backup", 20)),
    );
    let code = TransferCode::parse("amber-falcon-river");
    let sender = TransferSession::sender(sender_ctx, code.clone());
    let receiver = TransferSession::receiver(receiver_ctx, code);

    let (sent, received) = tokio::join!(sender.send("ledger.csv", b"id,amount\n1,40\n"), receiver.receive());

    // The sender handed the envelope over; only the receiver can tell
    sent.unwrap();
    assert!(matches!(received, Err(TransferError::Integrity(_))));
    assert_eq!(receiver.state(), SessionState::Failed);

    // Delivered once over memory, never retried over the backup
    let attempts = receiver.snapshot().attempts;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].transport, "memory");
    assert_eq!(attempts[0].outcome, AttemptOutcome::Succeeded);
}

#[tokio::test]
async fn test_flipped_ciphertext_bit_fails_verification() {
    receive_altered(|envelope| {
        let last = envelope.ciphertext.len() - 1;
        envelope.ciphertext[last] ^= 0x01;
    })
    .await;
}

#[tokio::test]
async fn test_forged_digest_fails_verification() {
    receive_altered(|envelope| {
        envelope.metadata.digest = "00".repeat(32);
    })
    .await;
}
