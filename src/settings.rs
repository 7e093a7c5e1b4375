//! Process-wide settings: local service ports and the daemon RPC endpoint.
//!
//! Loaded once per invocation and never mutated by the core. Missing file
//! or missing fields fall back to the defaults.

use crate::storage::JsonFile;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SOCKS_PORT: u16 = 1080;
pub const DEFAULT_DNS_PORT: u16 = 5053;
pub const DEFAULT_DAEMON_PORT: u16 = 6554;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Local SOCKS5 port the proxy core listens on.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Local port of the DNS-over-HTTPS forwarder.
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    /// Loopback TCP port of the privileged daemon.
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_dns_port() -> u16 {
    DEFAULT_DNS_PORT
}

fn default_daemon_port() -> u16 {
    DEFAULT_DAEMON_PORT
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socks_port: DEFAULT_SOCKS_PORT,
            dns_port: DEFAULT_DNS_PORT,
            daemon_port: DEFAULT_DAEMON_PORT,
        }
    }
}

impl JsonFile for Settings {
    const FILE_NAME: &'static str = "settings.json";
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.socks_port, 1080);
        assert_eq!(settings.dns_port, 5053);
        assert_eq!(settings.daemon_port, 6554);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");

        std::fs::write(&path, r#"{"socks_port": 9050}"#).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.socks_port, 9050);
        assert_eq!(settings.dns_port, DEFAULT_DNS_PORT);
        assert_eq!(settings.daemon_port, DEFAULT_DAEMON_PORT);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");

        let settings = Settings {
            socks_port: 1081,
            dns_port: 5353,
            daemon_port: 7000,
        };
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.socks_port, 1081);
        assert_eq!(loaded.dns_port, 5353);
        assert_eq!(loaded.daemon_port, 7000);
    }
}
