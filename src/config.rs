use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::TamperError;

pub const DEFAULT_SERVER: &str = "192.95.61.161";
pub const DEFAULT_SERVER_PORTS: [u16; 6] = [80, 443, 993, 8000, 5258, 6969];
pub const DEFAULT_HELPER_PATH: &str = "/usr/local/bin/tcptester";

/// Run configuration.
/// Every field may be left out of the json file, missing fields fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TamperConfig {
    /// Remote peer, literal address or host name.
    pub server: String,
    pub server_ports: Vec<u16>,
    /// Where the packet-crafting helper lives (or gets installed to).
    pub helper_path: PathBuf,
    /// Zip archive holding `tcptester_<arch>` payloads.
    pub helper_bundle: Option<PathBuf>,
    /// Explicit source addresses, skips interface enumeration when set.
    pub local_addrs: Option<Vec<IpAddr>>,
    pub seed: Option<u64>,
    pub extended_variants: bool,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub finish_timeout_ms: u64,
}

impl Default for TamperConfig {
    fn default() -> TamperConfig {
        TamperConfig {
            server: DEFAULT_SERVER.to_string(),
            server_ports: DEFAULT_SERVER_PORTS.to_vec(),
            helper_path: PathBuf::from(DEFAULT_HELPER_PATH),
            helper_bundle: None,
            local_addrs: None,
            seed: None,
            extended_variants: false,
            poll_interval_ms: 10,
            max_poll_interval_ms: 80,
            command_timeout_ms: 10_000,
            accept_timeout_ms: 10_000,
            // the reserved-bit variants run four handshakes of up to 10s each
            probe_timeout_ms: 60_000,
            finish_timeout_ms: 5_000,
        }
    }
}

fn invalid(field: &str, reason: &str) -> TamperError {
    TamperError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl TamperConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<TamperConfig, TamperError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: TamperConfig = serde_json::from_str(&content)?;
        debug!("load config from {}: {:?}", path.display(), config);
        config.validate()?;
        Ok(config)
    }
    /// Reject values the run cannot work with, zero timeouts included.
    pub fn validate(&self) -> Result<(), TamperError> {
        if self.server.trim().is_empty() {
            return Err(invalid("server", "empty"));
        }
        if self.server_ports.is_empty() {
            return Err(invalid("server_ports", "no port"));
        }
        if self.server_ports.contains(&0) {
            return Err(invalid("server_ports", "port 0"));
        }
        let durations = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("accept_timeout_ms", self.accept_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("finish_timeout_ms", self.finish_timeout_ms),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }
        Ok(())
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms))
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}
