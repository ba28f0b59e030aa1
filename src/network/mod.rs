//! Network classification
//!
//! The profiler decides what kind of network this machine sits on by trying
//! short TCP connections to a handful of well-known ports. The result drives
//! mode selection and is logged alongside transport ranking. It is computed
//! fresh for every session since networks change between runs.

mod profiler;

pub use profiler::{classify, proxy_from_env, NetworkProfiler, ProbeOutcome};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Connect latency above which a network with working native ports is
/// treated as mobile
pub const MOBILE_LATENCY_MS: u64 = 250;

/// Coarse classification of the local network
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Native ports reachable, no proxy
    Open,
    /// Only web ports, or nothing, reachable
    Restrictive,
    /// Traffic goes through an explicit proxy
    #[serde(alias = "corporate")]
    Institutional,
    /// Reachable but with high connect latency
    Mobile,
}

impl NetworkType {
    /// Every network type
    pub const ALL: [NetworkType; 4] = [
        NetworkType::Open,
        NetworkType::Restrictive,
        NetworkType::Institutional,
        NetworkType::Mobile,
    ];
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkType::Open => "open",
            NetworkType::Restrictive => "restrictive",
            NetworkType::Institutional => "institutional",
            NetworkType::Mobile => "mobile",
        };
        f.write_str(name)
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(NetworkType::Open),
            "restrictive" => Ok(NetworkType::Restrictive),
            "institutional" | "corporate" => Ok(NetworkType::Institutional),
            "mobile" => Ok(NetworkType::Mobile),
            other => Err(format!("unknown network type: {other}")),
        }
    }
}

/// Kind of proxy detected on the path to the internet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// No proxy
    #[default]
    None,
    /// SOCKS proxy
    Socks,
    /// HTTP(S) proxy
    Http,
}

/// Result of one network classification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// Overall classification
    pub network_type: NetworkType,
    /// True when none of the native transport ports answered
    pub is_restrictive: bool,
    /// Every port that accepted a connection
    pub reachable_ports: BTreeSet<u16>,
    /// Proxy found in the environment or on a local port
    pub detected_proxy_kind: ProxyKind,
}

impl NetworkProfile {
    /// Profile used when nothing is known, e.g. before probing
    pub fn unknown() -> Self {
        NetworkProfile {
            network_type: NetworkType::Restrictive,
            is_restrictive: true,
            reachable_ports: BTreeSet::new(),
            detected_proxy_kind: ProxyKind::None,
        }
    }

    /// Whether a probe reached the given port
    pub fn can_reach(&self, port: u16) -> bool {
        self.reachable_ports.contains(&port)
    }
}

/// Role a probed endpoint plays in classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// HTTP/HTTPS style port, open on almost every network
    Web,
    /// Port a transport backend needs directly
    Native,
    /// Local proxy listener
    Proxy,
}

/// An endpoint the profiler tries to connect to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// What a successful connection tells us
    pub kind: ProbeKind,
}

impl ProbeTarget {
    /// Create a probe target
    pub fn new(host: impl Into<String>, port: u16, kind: ProbeKind) -> Self {
        ProbeTarget {
            host: host.into(),
            port,
            kind,
        }
    }
}

/// Why a probe did not connect. Never escalated past the profiler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The shared probe deadline elapsed
    #[error("probe timed out")]
    Timeout,

    /// The connection was refused or could not be attempted
    #[error("connect failed: {0}")]
    Connect(String),
}
