//! Concurrent port probing and classification

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;

use super::{
    NetworkProfile, NetworkType, ProbeError, ProbeKind, ProbeTarget, ProxyKind, MOBILE_LATENCY_MS,
};

/// Environment variables consulted for proxy settings, in priority order
const PROXY_VARS: [&str; 6] = [
    "ALL_PROXY",
    "all_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
];

/// Outcome of probing one target
#[derive(Clone, Debug)]
pub struct ProbeOutcome {
    /// The probed endpoint
    pub target: ProbeTarget,
    /// Connect latency, or why the probe failed
    pub result: Result<Duration, ProbeError>,
}

impl ProbeOutcome {
    /// Whether the target accepted a connection
    pub fn is_reachable(&self) -> bool {
        self.result.is_ok()
    }
}

/// Classifies the local network by probing well-known ports
#[derive(Clone, Debug)]
pub struct NetworkProfiler {
    targets: Vec<ProbeTarget>,
}

impl NetworkProfiler {
    /// Create a profiler for the given targets
    pub fn new(targets: Vec<ProbeTarget>) -> Self {
        NetworkProfiler { targets }
    }

    /// Targets probed on every classification
    pub fn targets(&self) -> &[ProbeTarget] {
        &self.targets
    }

    /// Probe every target concurrently and classify the network
    ///
    /// Returns once all probes finished or `timeout` elapsed. Probes that
    /// fail or run out of time count as unreachable; this never errors.
    pub async fn classify(&self, timeout: Duration) -> NetworkProfile {
        let deadline = Instant::now() + timeout;
        let outcomes = self.run_probes(deadline).await;
        let profile = classify(&outcomes, proxy_from_env(|key| std::env::var(key).ok()));

        debug!(
            "Network classified as {} (reachable ports: {:?}, proxy: {:?})",
            profile.network_type, profile.reachable_ports, profile.detected_proxy_kind
        );
        profile
    }

    async fn run_probes(&self, deadline: Instant) -> Vec<ProbeOutcome> {
        let mut probes = JoinSet::new();
        for target in self.targets.iter().cloned() {
            probes.spawn(probe(target, deadline));
        }

        let mut outcomes = Vec::with_capacity(self.targets.len());
        loop {
            match tokio::time::timeout_at(deadline, probes.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    if let Err(e) = &outcome.result {
                        debug!(
                            "Probe {}:{} unreachable: {}",
                            outcome.target.host, outcome.target.port, e
                        );
                    }
                    outcomes.push(outcome);
                }
                Ok(Some(Err(e))) => debug!("Probe task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    debug!("Probe deadline reached with {} probes pending", probes.len());
                    probes.abort_all();
                    break;
                }
            }
        }
        outcomes
    }
}

async fn probe(target: ProbeTarget, deadline: Instant) -> ProbeOutcome {
    let started = Instant::now();
    let connect = TcpStream::connect((target.host.as_str(), target.port));

    let result = match tokio::time::timeout_at(deadline, connect).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(started.elapsed())
        }
        Ok(Err(e)) => Err(ProbeError::Connect(e.to_string())),
        Err(_) => Err(ProbeError::Timeout),
    };

    ProbeOutcome { target, result }
}

/// Turn probe outcomes into a profile
///
/// A detected proxy means an institutional network. Otherwise a network
/// where no native port answered is restrictive, which covers the case of
/// only HTTP/HTTPS getting through. Slow but working networks are mobile.
pub fn classify(outcomes: &[ProbeOutcome], env_proxy: ProxyKind) -> NetworkProfile {
    let reachable: Vec<&ProbeOutcome> = outcomes.iter().filter(|o| o.is_reachable()).collect();

    let reachable_ports: BTreeSet<u16> = reachable.iter().map(|o| o.target.port).collect();
    let native_ok = reachable.iter().any(|o| o.target.kind == ProbeKind::Native);

    let detected_proxy_kind = if env_proxy != ProxyKind::None {
        env_proxy
    } else {
        reachable
            .iter()
            .filter(|o| o.target.kind == ProbeKind::Proxy)
            .map(|o| match o.target.port {
                1080 | 9050 => ProxyKind::Socks,
                _ => ProxyKind::Http,
            })
            .next()
            .unwrap_or(ProxyKind::None)
    };

    let network_type = if detected_proxy_kind != ProxyKind::None {
        NetworkType::Institutional
    } else if !native_ok {
        NetworkType::Restrictive
    } else if median_latency(&reachable) > Duration::from_millis(MOBILE_LATENCY_MS) {
        NetworkType::Mobile
    } else {
        NetworkType::Open
    };

    NetworkProfile {
        network_type,
        is_restrictive: !native_ok,
        reachable_ports,
        detected_proxy_kind,
    }
}

fn median_latency(reachable: &[&ProbeOutcome]) -> Duration {
    let mut latencies: Vec<Duration> = reachable
        .iter()
        .filter(|o| o.target.kind != ProbeKind::Proxy)
        .filter_map(|o| o.result.as_ref().ok().copied())
        .collect();
    if latencies.is_empty() {
        return Duration::ZERO;
    }
    latencies.sort();
    latencies[latencies.len() / 2]
}

/// Proxy kind configured through the usual environment variables
pub fn proxy_from_env(lookup: impl Fn(&str) -> Option<String>) -> ProxyKind {
    PROXY_VARS
        .iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_ascii_lowercase())
        .find(|value| !value.is_empty())
        .map(|value| {
            if value.starts_with("socks") {
                ProxyKind::Socks
            } else {
                ProxyKind::Http
            }
        })
        .unwrap_or(ProxyKind::None)
}
