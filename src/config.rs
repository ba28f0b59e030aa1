//! Configuration management.
//!
//! Settings live in `<config dir>/passage/config.json`. Every field has a
//! default, so a missing file or a partial file both work. A few settings can
//! be overridden through environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::engine::DEFAULT_CONTEXT;
use crate::error::{Result, TransferError};
use crate::network::{ProbeKind, ProbeTarget};

/// Default relay location, matching `passage-relay` defaults
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8765";

/// Overrides `relay_url`
pub const ENV_RELAY_URL: &str = "PASSAGE_RELAY_URL";

/// Overrides `shared_dir`
pub const ENV_SHARED_DIR: &str = "PASSAGE_SHARED_DIR";

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL of the relay server.
    pub relay_url: String,

    /// Directory shared between peers (network mount, synced folder).
    /// The shared-directory transport is only registered when set.
    pub shared_dir: Option<PathBuf>,

    /// Key-derivation context. Both peers must use the same value.
    pub kdf_context: String,

    /// Total time budget for network probing.
    pub probe_timeout_ms: u64,

    /// Time limit for a single transport attempt.
    pub attempt_timeout_secs: u64,

    /// Hard ceiling for a whole failover run.
    pub max_failover_secs: u64,

    /// Largest file the relay carries, in MiB. Bounds WebSocket messages.
    pub max_file_size_mb: u64,

    /// Probe targets (None = derived from the relay URL).
    pub probe_targets: Option<Vec<ProbeTarget>>,

    /// Priority of the relay transport (lower is tried first).
    pub relay_priority: i32,

    /// Priority of the shared-directory transport.
    pub shared_dir_priority: i32,

    /// Where received files are written.
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            shared_dir: None,
            kdf_context: DEFAULT_CONTEXT.to_string(),
            probe_timeout_ms: 3_000,
            attempt_timeout_secs: 120,
            max_failover_secs: 600,
            max_file_size_mb: 512,
            probe_targets: None,
            relay_priority: 10,
            shared_dir_priority: 50,
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    /// Load configuration from the default config file.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from a specific file, defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration, then apply environment overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_RELAY_URL).filter(|v| !v.trim().is_empty()) {
            self.relay_url = url.trim().to_string();
        }

        if let Some(dir) = lookup(ENV_SHARED_DIR).filter(|v| !v.trim().is_empty()) {
            self.shared_dir = Some(PathBuf::from(dir.trim()));
        }
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings that would make every transfer fail.
    pub fn validate(&self) -> Result<()> {
        if self.kdf_context.is_empty() {
            return Err(TransferError::Config("kdf_context must not be empty".into()));
        }
        if self.probe_timeout_ms == 0 || self.attempt_timeout_secs == 0 {
            return Err(TransferError::Config("timeouts must be greater than zero".into()));
        }
        if self.max_failover_secs < self.attempt_timeout_secs {
            return Err(TransferError::Config(
                "max_failover_secs must be at least attempt_timeout_secs".into(),
            ));
        }
        if self.max_file_size_mb == 0 {
            return Err(TransferError::Config("max_file_size_mb must be greater than zero".into()));
        }
        if relay_endpoint(&self.relay_url).is_none() {
            return Err(TransferError::Config(format!(
                "relay_url is not a ws:// or wss:// URL: {}",
                self.relay_url
            )));
        }
        Ok(())
    }

    /// Probe budget as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Per-attempt budget as a duration.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Failover ceiling as a duration.
    pub fn max_failover(&self) -> Duration {
        Duration::from_secs(self.max_failover_secs)
    }

    /// Relay file size limit in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Targets the network profiler probes.
    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        if let Some(targets) = &self.probe_targets {
            return targets.clone();
        }

        let mut targets = vec![
            ProbeTarget::new("1.1.1.1", 80, ProbeKind::Web),
            ProbeTarget::new("1.1.1.1", 443, ProbeKind::Web),
            ProbeTarget::new("127.0.0.1", 1080, ProbeKind::Proxy),
            ProbeTarget::new("127.0.0.1", 3128, ProbeKind::Proxy),
        ];
        if let Some((host, port)) = relay_endpoint(&self.relay_url) {
            targets.push(ProbeTarget::new(host, port, ProbeKind::Native));
        }
        targets
    }
}

/// Host and port of a `ws://` or `wss://` URL.
pub fn relay_endpoint(url: &str) -> Option<(String, u16)> {
    let (rest, default_port) = if let Some(rest) = url.strip_prefix("ws://") {
        (rest, 80)
    } else if let Some(rest) = url.strip_prefix("wss://") {
        (rest, 443)
    } else {
        return None;
    };

    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return None;
    }

    // Bracketed IPv6 literal
    if let Some(v6) = authority.strip_prefix('[') {
        let (host, tail) = v6.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

/// Default configuration file path.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("passage")
        .join("config.json")
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.attempt_timeout(), Duration::from_secs(120));
        assert!(config
            .probe_targets()
            .iter()
            .any(|t| t.kind == ProbeKind::Native && t.port == 8765));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "relay_url": "wss://relay.example.org/ws", "relay_priority": 3 }"#)
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.relay_url, "wss://relay.example.org/ws");
        assert_eq!(config.relay_priority, 3);
        assert_eq!(config.shared_dir_priority, 50);
        assert_eq!(config.kdf_context, DEFAULT_CONTEXT);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.shared_dir = Some(PathBuf::from("/mnt/team-share"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.shared_dir, Some(PathBuf::from("/mnt/team-share")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.relay_url = "http://relay".into();
        assert!(matches!(config.validate(), Err(TransferError::Config(_))));

        let mut config = Config::default();
        config.max_failover_secs = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_file_size_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            ENV_RELAY_URL => Some("ws://10.0.0.5:9000".into()),
            ENV_SHARED_DIR => Some("/srv/drop".into()),
            _ => None,
        });
        assert_eq!(config.relay_url, "ws://10.0.0.5:9000");
        assert_eq!(config.shared_dir, Some(PathBuf::from("/srv/drop")));
    }

    #[test]
    fn test_relay_endpoint_parsing() {
        assert_eq!(relay_endpoint("ws://127.0.0.1:8765"), Some(("127.0.0.1".into(), 8765)));
        assert_eq!(relay_endpoint("wss://relay.example.org/ws"), Some(("relay.example.org".into(), 443)));
        assert_eq!(relay_endpoint("ws://[::1]:9000/x"), Some(("::1".into(), 9000)));
        assert_eq!(relay_endpoint("ws://host:notaport"), None);
        assert_eq!(relay_endpoint("tcp://host:1"), None);
        assert_eq!(relay_endpoint("ws://"), None);
    }
}
