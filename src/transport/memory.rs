//! In-memory transport
//!
//! Peers attached to the same [`MemoryHub`] meet in a mailbox keyed by the
//! transfer ID. A send completes once a receiver has taken the envelope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{Envelope, TransferId, Transport, TransportError, TransportResult};
use crate::config::Config;

type Delivery = (Envelope, oneshot::Sender<()>);

#[derive(Clone)]
struct Mailbox {
    tx: mpsc::Sender<Delivery>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Mailbox {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

/// Rendezvous point shared by in-memory transports
#[derive(Clone, Default)]
pub struct MemoryHub {
    mailboxes: Arc<Mutex<HashMap<TransferId, Mailbox>>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self, id: &TransferId) -> TransportResult<Mailbox> {
        let mut mailboxes = self
            .mailboxes
            .lock()
            .map_err(|_| TransportError::Unavailable("memory hub poisoned".to_string()))?;
        Ok(mailboxes.entry(id.clone()).or_insert_with(Mailbox::new).clone())
    }

    fn remove(&self, id: &TransferId) {
        if let Ok(mut mailboxes) = self.mailboxes.lock() {
            mailboxes.remove(id);
        }
    }

    /// Take a mailbox for one exchange; it is handed back when the claim drops
    fn claim<'a>(&'a self, id: &'a TransferId) -> TransportResult<MailboxClaim<'a>> {
        Ok(MailboxClaim {
            hub: self,
            id,
            mailbox: Some(self.mailbox(id)?),
        })
    }

    /// Drop the entry once no other peer holds it
    fn release(&self, id: &TransferId, mailbox: Mailbox) {
        let Ok(mut mailboxes) = self.mailboxes.lock() else {
            return;
        };
        let idle = mailboxes.get(id).is_some_and(|entry| {
            Arc::ptr_eq(&entry.rx, &mailbox.rx) && Arc::strong_count(&mailbox.rx) == 2
        });
        if idle {
            mailboxes.remove(id);
        }
        drop(mailbox);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.mailboxes.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// A peer's hold on a mailbox, released even when the exchange is dropped
struct MailboxClaim<'a> {
    hub: &'a MemoryHub,
    id: &'a TransferId,
    mailbox: Option<Mailbox>,
}

impl MailboxClaim<'_> {
    fn mailbox(&self) -> TransportResult<&Mailbox> {
        self.mailbox.as_ref().ok_or(TransportError::Disconnected)
    }
}

impl Drop for MailboxClaim<'_> {
    fn drop(&mut self) {
        if let Some(mailbox) = self.mailbox.take() {
            self.hub.release(self.id, mailbox);
        }
    }
}

/// In-memory transport endpoint
pub struct MemoryTransport {
    name: String,
    priority: i32,
    hub: MemoryHub,
    available: AtomicBool,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Create an endpoint attached to `hub`
    pub fn new(name: impl Into<String>, priority: i32, hub: MemoryHub) -> Self {
        MemoryTransport {
            name: name.into(),
            priority,
            hub,
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Change what the liveness probe reports
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

/// Leave `envelope` in the mailbox and wait for the receiver's ack
async fn post(mailbox: &Mailbox, envelope: &Envelope, cancel: &CancellationToken) -> TransportResult<()> {
    let (ack_tx, ack_rx) = oneshot::channel();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        sent = mailbox.tx.send((envelope.clone(), ack_tx)) => {
            sent.map_err(|_| TransportError::SendFailed("Channel closed".to_string()))?;
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        ack = ack_rx => ack.map_err(|_| TransportError::Disconnected),
    }
}

/// Take the first envelope whose sender is still waiting
async fn collect(mailbox: &Mailbox, cancel: &CancellationToken) -> TransportResult<Envelope> {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            delivery = async { mailbox.rx.lock().await.recv().await } => delivery,
        };

        let (envelope, ack) = delivery.ok_or(TransportError::Disconnected)?;
        // A sender that gave up no longer waits for the ack; skip its envelope
        if ack.send(()).is_ok() {
            return Ok(envelope);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn setup(&self, _config: &Config) -> TransportResult<()> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope, cancel: &CancellationToken) -> TransportResult<()> {
        self.ensure_open()?;

        let claim = self.hub.claim(&envelope.metadata.transfer_id)?;
        post(claim.mailbox()?, envelope, cancel).await
    }

    async fn receive(
        &self,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> TransportResult<Envelope> {
        self.ensure_open()?;

        let claim = self.hub.claim(transfer_id)?;
        let envelope = collect(claim.mailbox()?, cancel).await?;
        self.hub.remove(transfer_id);
        Ok(envelope)
    }

    async fn is_available(&self, _cancel: &CancellationToken) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.available.load(Ordering::SeqCst)
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkType;
    use crate::transport::TransferMetadata;
    use std::time::Duration;

    fn envelope(code: &str) -> Envelope {
        Envelope {
            metadata: TransferMetadata::describe(
                TransferId::derive(code),
                "a.bin",
                b"abc",
                NetworkType::Open,
            ),
            ciphertext: b"ciphertext".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_memory_transport() {
        let hub = MemoryHub::new();
        let alice = Arc::new(MemoryTransport::new("memory", 1, hub.clone()));
        let bob = MemoryTransport::new("memory", 1, hub);
        let cancel = CancellationToken::new();

        let sent = envelope("amber-falcon-river");
        let id = sent.metadata.transfer_id.clone();

        let sender = {
            let alice = alice.clone();
            let sent = sent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { alice.send(&sent, &cancel).await })
        };

        let received = bob.receive(&id, &cancel).await.unwrap();
        assert_eq!(received, sent);
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transfers_are_isolated_by_id() {
        let hub = MemoryHub::new();
        let alice = Arc::new(MemoryTransport::new("memory", 1, hub.clone()));
        let bob = MemoryTransport::new("memory", 1, hub);
        let cancel = CancellationToken::new();

        let other = envelope("other-code-entirely");
        let alice_task = {
            let alice = alice.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { alice.send(&other, &cancel).await })
        };

        let wanted = TransferId::derive("amber-falcon-river");
        let result = tokio::time::timeout(Duration::from_millis(100), bob.receive(&wanted, &cancel)).await;
        assert!(result.is_err(), "receive must not see another transfer's envelope");

        cancel.cancel();
        assert_eq!(alice_task.await.unwrap(), Err(TransportError::Cancelled));
    }

    #[tokio::test]
    async fn test_abandoned_send_is_skipped() {
        let hub = MemoryHub::new();
        let alice = MemoryTransport::new("memory", 1, hub.clone());
        let bob = MemoryTransport::new("memory", 1, hub);

        let mut stale = envelope("amber-falcon-river");
        stale.ciphertext = b"stale".to_vec();
        let id = stale.metadata.transfer_id.clone();

        // Enqueued, then abandoned before anyone received it
        let gave_up = tokio::time::timeout(
            Duration::from_millis(50),
            alice.send(&stale, &CancellationToken::new()),
        )
        .await;
        assert!(gave_up.is_err());

        let fresh = envelope("amber-falcon-river");
        let cancel = CancellationToken::new();
        let (sent, received) = tokio::join!(alice.send(&fresh, &cancel), bob.receive(&id, &cancel));
        sent.unwrap();
        assert_eq!(received.unwrap(), fresh);
    }

    #[tokio::test]
    async fn test_unfinished_exchanges_leave_hub_empty() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new("memory", 1, hub.clone());
        let id = TransferId::derive("amber-falcon-river");

        let cancel = CancellationToken::new();
        let waiting = tokio::time::timeout(Duration::from_millis(30), transport.receive(&id, &cancel)).await;
        assert!(waiting.is_err());
        assert_eq!(hub.len(), 0);

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            })
        };
        assert_eq!(transport.receive(&id, &cancel).await, Err(TransportError::Cancelled));
        assert_eq!(transport.send(&envelope("amber-falcon-river"), &cancel).await, Err(TransportError::Cancelled));
        canceller.await.unwrap();
        assert_eq!(hub.len(), 0);
    }

    #[tokio::test]
    async fn test_mailbox_kept_while_peer_waits() {
        let hub = MemoryHub::new();
        let alice = Arc::new(MemoryTransport::new("memory", 1, hub.clone()));
        let bob = MemoryTransport::new("memory", 1, hub.clone());
        let sent = envelope("amber-falcon-river");
        let id = sent.metadata.transfer_id.clone();

        let cancel = CancellationToken::new();
        let sender = {
            let alice = alice.clone();
            let sent = sent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { alice.send(&sent, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A receiver that gives up must not strand the waiting sender
        let impatient = CancellationToken::new();
        impatient.cancel();
        assert_eq!(bob.receive(&id, &impatient).await, Err(TransportError::Cancelled));
        assert_eq!(hub.len(), 1);

        assert_eq!(bob.receive(&id, &cancel).await.unwrap(), sent);
        sender.await.unwrap().unwrap();
        assert_eq!(hub.len(), 0);
    }

    #[tokio::test]
    async fn test_receive_honours_cancellation() {
        let transport = MemoryTransport::new("memory", 1, MemoryHub::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let id = TransferId::derive("amber-falcon-river");
        assert_eq!(
            transport.receive(&id, &cancel).await,
            Err(TransportError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_memory_transport_close() {
        let transport = MemoryTransport::new("memory", 1, MemoryHub::new());
        let cancel = CancellationToken::new();

        // Close before setup is fine
        transport.close().await.unwrap();
        assert!(!transport.is_available(&cancel).await);
        assert_eq!(
            transport.send(&envelope("amber-falcon-river"), &cancel).await,
            Err(TransportError::Disconnected)
        );

        transport.setup(&Config::default()).await.unwrap();
        assert!(transport.is_available(&cancel).await);

        transport.set_available(false);
        assert!(!transport.is_available(&cancel).await);
    }
}
