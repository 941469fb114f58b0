//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use skiff_core::{DISCOVERY_PORT, HANDSHAKE_PORT};

/// Daemon configuration. File: ~/.config/skiff/config.toml or /etc/skiff/config.toml.
/// Env overrides: SKIFF_DEVICE_NAME, SKIFF_DISCOVERY_PORT, SKIFF_HANDSHAKE_PORT,
/// SKIFF_TRANSFER_PORT, SKIFF_CONNECTIONS, SKIFF_SHARE_ROOT, SKIFF_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name announced on the broadcast channel (default: hostname).
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Discovery UDP port (default 6666).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session handshake TCP port (default 6667).
    #[serde(default = "default_handshake_port")]
    pub handshake_port: u16,
    /// Range transfer TCP port (default 6668).
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    /// Parallel connections per download (default 4). Consumed by the
    /// receiving side when it starts a download; the serving path never
    /// reads it.
    #[serde(default = "default_connections")]
    pub connections: u32,
    /// Directory tree served to peers (default: home directory).
    #[serde(default = "default_share_root")]
    pub share_root: PathBuf,
    /// Where accepted files land (default: share_root).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "skiff-device".to_string())
}
fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}
fn default_handshake_port() -> u16 {
    HANDSHAKE_PORT
}
fn default_transfer_port() -> u16 {
    6668
}
fn default_connections() -> u32 {
    skiff_core::transfer::DEFAULT_CONNECTIONS
}
fn default_share_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            discovery_port: default_discovery_port(),
            handshake_port: default_handshake_port(),
            transfer_port: default_transfer_port(),
            connections: default_connections(),
            share_root: default_share_root(),
            download_dir: None,
        }
    }
}

impl Config {
    /// Effective landing directory for incoming files.
    pub fn download_dir(&self) -> &std::path::Path {
        self.download_dir.as_deref().unwrap_or(&self.share_root)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("SKIFF_DEVICE_NAME") {
        if !s.is_empty() {
            c.device_name = s;
        }
    }
    if let Ok(s) = std::env::var("SKIFF_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("SKIFF_HANDSHAKE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.handshake_port = p;
        }
    }
    if let Ok(s) = std::env::var("SKIFF_TRANSFER_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transfer_port = p;
        }
    }
    if let Ok(s) = std::env::var("SKIFF_CONNECTIONS") {
        if let Ok(n) = s.parse::<u32>() {
            if n > 0 {
                c.connections = n;
            }
        }
    }
    if let Ok(s) = std::env::var("SKIFF_SHARE_ROOT") {
        if !s.is_empty() {
            c.share_root = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("SKIFF_DOWNLOAD_DIR") {
        if !s.is_empty() {
            c.download_dir = Some(PathBuf::from(s));
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/skiff/config.toml"));
    }
    out.push(PathBuf::from("/etc/skiff/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn defaults_match_protocol_ports() {
        let c = Config::default();
        assert_eq!(c.discovery_port, 6666);
        assert_eq!(c.handshake_port, 6667);
        assert_eq!(c.transfer_port, 6668);
        assert_eq!(c.connections, 4);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let c: Config = toml::from_str("device_name = \"den\"\ntransfer_port = 7000\n").unwrap();
        assert_eq!(c.device_name, "den");
        assert_eq!(c.transfer_port, 7000);
        assert_eq!(c.discovery_port, 6666);
        assert_eq!(c.connections, 4);
    }

    #[test]
    fn download_dir_falls_back_to_share_root() {
        let mut c = Config::default();
        c.share_root = PathBuf::from("/srv/share");
        assert_eq!(c.download_dir(), Path::new("/srv/share"));
        c.download_dir = Some(PathBuf::from("/srv/incoming"));
        assert_eq!(c.download_dir(), Path::new("/srv/incoming"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("mystery = 1\n").is_err());
    }
}
