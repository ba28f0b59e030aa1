//! Transport ranking and failover
//!
//! The manager owns the registered backends. For each session it probes them,
//! ranks them, and tries them one at a time until one succeeds. Backend
//! failures are absorbed into the attempt log and only surface once every
//! backend has been tried.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Envelope, TransferId, Transport, TransportError, TransportResult};
use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::network::NetworkProfile;

/// How long a timed-out or cancelled attempt gets to wind down
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Result of one transport attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The backend completed the operation
    Succeeded,
    /// The backend reported an error
    Failed(String),
    /// The backend did not finish within the attempt timeout
    TimedOut,
    /// The caller cancelled while this attempt was in flight
    Cancelled,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Succeeded => write!(f, "succeeded"),
            AttemptOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            AttemptOutcome::TimedOut => write!(f, "timed out"),
            AttemptOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry of the attempt log
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Backend name
    pub transport: String,
    /// What happened
    pub outcome: AttemptOutcome,
    /// Time spent on the attempt
    pub elapsed: Duration,
}

/// Ordered record of every transport attempt made by a session
///
/// Cloning yields a handle to the same log; use [`AttemptLog::records`] to
/// take a copy.
#[derive(Clone, Debug, Default)]
pub struct AttemptLog {
    records: Arc<Mutex<Vec<AttemptRecord>>>,
}

impl AttemptLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn push(&self, record: AttemptRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    /// Copy of the records so far
    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Number of attempts recorded
    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    /// Whether nothing has been attempted yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hooks invoked as failover progresses
pub trait FailoverObserver: Send + Sync {
    /// Attempt number `attempt` (1-based) of `total` is starting
    fn attempt_started(&self, _transport: &str, _attempt: usize, _total: usize) {}

    /// An attempt ended without success
    fn attempt_failed(&self, _record: &AttemptRecord) {}
}

impl FailoverObserver for () {}

/// A backend together with the result of its availability probe
#[derive(Clone)]
pub struct RankedTransport {
    /// The backend
    pub backend: Arc<dyn Transport>,
    /// False when the probe failed or timed out; such backends are deferred
    pub available: bool,
}

impl RankedTransport {
    /// Backend name
    pub fn name(&self) -> &str {
        self.backend.name()
    }
}

impl fmt::Debug for RankedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedTransport")
            .field("name", &self.backend.name())
            .field("priority", &self.backend.priority())
            .field("available", &self.available)
            .finish()
    }
}

enum Attempt<T> {
    Done(TransportResult<T>),
    TimedOut,
    Cancelled,
}

/// Registry of backends plus the failover policy
pub struct TransportManager {
    transports: Vec<Arc<dyn Transport>>,
    attempt_timeout: Duration,
    max_failover: Duration,
    probe_timeout: Duration,
}

impl TransportManager {
    /// Create an empty manager
    pub fn new(attempt_timeout: Duration, max_failover: Duration, probe_timeout: Duration) -> Self {
        TransportManager {
            transports: Vec::new(),
            attempt_timeout,
            max_failover,
            probe_timeout,
        }
    }

    /// Create an empty manager with the timeouts from `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.attempt_timeout(),
            config.max_failover(),
            config.probe_timeout(),
        )
    }

    /// Register a backend. Registration order breaks priority ties.
    pub fn register(&mut self, backend: Arc<dyn Transport>) {
        info!(
            "Registered transport {} (priority {})",
            backend.name(),
            backend.priority()
        );
        self.transports.push(backend);
    }

    /// Builder-style [`TransportManager::register`]
    pub fn with_transport(mut self, backend: Arc<dyn Transport>) -> Self {
        self.register(backend);
        self
    }

    /// Registered backends in registration order
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Per-attempt time limit
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Hard limit for a failover run over `n` backends
    pub fn failover_ceiling(&self, n: usize) -> Duration {
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        self.attempt_timeout
            .checked_mul(n)
            .unwrap_or(Duration::MAX)
            .min(self.max_failover)
    }

    /// Set up every backend. A backend that fails here stays registered and
    /// will most likely be deferred by its availability probe.
    pub async fn setup_all(&self, config: &Config) {
        for backend in &self.transports {
            if let Err(e) = backend.setup(config).await {
                warn!("Setup of {} failed: {}", backend.name(), e);
            }
        }
    }

    /// Close every backend, logging failures
    pub async fn close_all(&self) {
        for backend in &self.transports {
            if let Err(e) = backend.close().await {
                warn!("Closing {} failed: {}", backend.name(), e);
            }
        }
    }

    /// Rank the backends for one transfer
    ///
    /// Probes run concurrently, each bounded by the probe timeout. The result
    /// is sorted by (deferred, priority, registration order); backends whose
    /// probe failed stay in the list behind the available ones.
    pub async fn select_order(
        &self,
        profile: &NetworkProfile,
        payload_size: u64,
        cancel: &CancellationToken,
    ) -> Vec<RankedTransport> {
        debug!(
            "Ranking {} transports for {} bytes on a {} network",
            self.transports.len(),
            payload_size,
            profile.network_type
        );

        let probes = self.transports.iter().map(|backend| async move {
            let probe = tokio::time::timeout(self.probe_timeout, backend.is_available(cancel));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                result = probe => result.unwrap_or(false),
            }
        });
        let availability = join_all(probes).await;

        let mut ranked: Vec<(usize, RankedTransport)> = self
            .transports
            .iter()
            .zip(availability)
            .map(|(backend, available)| RankedTransport {
                backend: backend.clone(),
                available,
            })
            .enumerate()
            .collect();

        ranked.sort_by_key(|(index, entry)| (!entry.available, entry.backend.priority(), *index));

        for (_, entry) in &ranked {
            if !entry.available {
                debug!("Deferring {}: availability probe failed", entry.name());
            }
        }

        ranked.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Send `envelope` over the first backend in `order` that succeeds.
    /// Returns the name of that backend.
    pub async fn send_with_failover(
        &self,
        order: &[RankedTransport],
        envelope: &Envelope,
        log: &AttemptLog,
        observer: &dyn FailoverObserver,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let (name, ()) = self
            .failover(order, log, observer, cancel, |backend, token| async move {
                backend.send(envelope, &token).await
            })
            .await?;
        Ok(name)
    }

    /// Receive the envelope for `transfer_id` from the first backend in
    /// `order` that delivers it.
    pub async fn receive_with_failover(
        &self,
        order: &[RankedTransport],
        transfer_id: &TransferId,
        log: &AttemptLog,
        observer: &dyn FailoverObserver,
        cancel: &CancellationToken,
    ) -> Result<(String, Envelope)> {
        self.failover(order, log, observer, cancel, |backend, token| async move {
            backend.receive(transfer_id, &token).await
        })
        .await
    }

    async fn failover<T, F, Fut>(
        &self,
        order: &[RankedTransport],
        log: &AttemptLog,
        observer: &dyn FailoverObserver,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<(String, T)>
    where
        F: Fn(Arc<dyn Transport>, CancellationToken) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let started = Instant::now();
        let ceiling = self.failover_ceiling(order.len());
        let mut attempts = Vec::with_capacity(order.len());

        for (index, entry) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Cancelled before trying {}", entry.name());
                return Err(TransferError::Cancelled);
            }

            let remaining = ceiling.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(
                    "Failover ceiling of {:?} reached, {} transports untried",
                    ceiling,
                    order.len() - index
                );
                break;
            }

            let name = entry.name().to_string();
            observer.attempt_started(&name, index + 1, order.len());
            info!("Trying transport {} ({}/{})", name, index + 1, order.len());

            let attempt_started = Instant::now();
            let token = cancel.child_token();
            let op = operation(entry.backend.clone(), token.clone());
            tokio::pin!(op);

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => Attempt::Cancelled,
                result = &mut op => Attempt::Done(result),
                _ = tokio::time::sleep(self.attempt_timeout.min(remaining)) => Attempt::TimedOut,
            };

            // A backend that finishes while being stopped keeps its result
            let attempt = match attempt {
                Attempt::Done(result) => Attempt::Done(result),
                stopped => {
                    token.cancel();
                    match tokio::time::timeout(CANCEL_GRACE, &mut op).await {
                        Ok(Ok(value)) => {
                            info!("Transport {} finished while being stopped", name);
                            Attempt::Done(Ok(value))
                        }
                        Ok(Err(_)) => stopped,
                        Err(_) => {
                            warn!("{} ignored cancellation", name);
                            stopped
                        }
                    }
                }
            };

            let outcome = match attempt {
                Attempt::Done(Ok(value)) => {
                    log.push(AttemptRecord {
                        transport: name.clone(),
                        outcome: AttemptOutcome::Succeeded,
                        elapsed: attempt_started.elapsed(),
                    });
                    info!("Transport {} succeeded", name);
                    return Ok((name, value));
                }
                Attempt::Done(Err(e)) => AttemptOutcome::Failed(e.to_string()),
                Attempt::TimedOut => AttemptOutcome::TimedOut,
                Attempt::Cancelled => {
                    log.push(AttemptRecord {
                        transport: name,
                        outcome: AttemptOutcome::Cancelled,
                        elapsed: attempt_started.elapsed(),
                    });
                    return Err(TransferError::Cancelled);
                }
            };

            let record = AttemptRecord {
                transport: name,
                outcome,
                elapsed: attempt_started.elapsed(),
            };
            warn!("Transport {} {}", record.transport, record.outcome);
            log.push(record.clone());
            observer.attempt_failed(&record);
            attempts.push(record);
        }

        Err(TransferError::AllTransportsExhausted { attempts })
    }
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.transports.iter().map(|t| t.name()).collect();
        f.debug_struct("TransportManager")
            .field("transports", &names)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("max_failover", &self.max_failover)
            .finish()
    }
}
