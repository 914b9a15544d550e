// src/config.rs
// Server configuration from environment variables, with startup validation.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{error, info, warn};

/// Runtime configuration for a home server.
///
/// Binaries set these env vars from CLI flags before calling into the
/// library:
/// - `OLAF_BIND_ADDR`   listen address for the WebSocket + HTTP surface
/// - `OLAF_PUBLIC_ADDR` host:port peers and file URLs use to reach us
/// - `OLAF_PEERS`       comma-separated host:port neighbourhood list
/// - `OLAF_FILES_DIR`   directory backing /api/upload and /downloads
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub public_addr: String,
    pub peers: Vec<String>,
    pub files_dir: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let bind = env::var("OLAF_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".into());
        let bind_addr: SocketAddr = bind.parse().unwrap_or_else(|_| {
            warn!("OLAF_BIND_ADDR '{}' invalid, falling back to 0.0.0.0:9000", bind);
            "0.0.0.0:9000".parse().expect("default bind addr")
        });

        let public_addr = env::var("OLAF_PUBLIC_ADDR")
            .unwrap_or_else(|_| format!("127.0.0.1:{}", bind_addr.port()));

        let peers = env::var("OLAF_PEERS")
            .unwrap_or_default()
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let files_dir = PathBuf::from(env::var("OLAF_FILES_DIR").unwrap_or_else(|_| "files".into()));

        Self {
            bind_addr,
            public_addr,
            peers,
            files_dir,
        }
    }
}

/// Validation result for configuration checks
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        for w in &self.warnings {
            warn!("config: {}", w);
        }
        for e in &self.errors {
            error!("config: {}", e);
        }
        if self.valid && self.warnings.is_empty() {
            info!("configuration validation passed");
        }
    }
}

/// Validate a configuration before the server starts serving.
pub fn validate_config(config: &ServerConfig) -> ConfigValidation {
    let mut validation = ConfigValidation::new();

    if config.public_addr.is_empty() {
        validation.add_error("OLAF_PUBLIC_ADDR must not be empty".into());
    } else if !looks_like_host_port(&config.public_addr) {
        validation.add_error(format!(
            "OLAF_PUBLIC_ADDR '{}' is not host:port",
            config.public_addr
        ));
    }

    if config.peers.is_empty() {
        validation.add_warning("OLAF_PEERS not set, running as a standalone server".into());
    }
    for peer in &config.peers {
        if !looks_like_host_port(peer) {
            validation.add_error(format!("peer '{}' is not host:port", peer));
        }
        if *peer == config.public_addr {
            validation.add_warning(format!(
                "peer list contains our own address {}, it will be skipped",
                peer
            ));
        }
    }

    if config.files_dir.as_os_str().is_empty() {
        validation.add_error("OLAF_FILES_DIR must not be empty".into());
    }

    validation
}

fn looks_like_host_port(s: &str) -> bool {
    match s.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:9000".parse().unwrap(),
            public_addr: "127.0.0.1:9000".into(),
            peers: vec![],
            files_dir: PathBuf::from("files"),
        }
    }

    #[test]
    fn accepts_standalone_config() {
        let v = validate_config(&base_config());
        assert!(v.valid);
        // standalone is allowed but worth a warning
        assert_eq!(v.warnings.len(), 1);
    }

    #[test]
    fn rejects_malformed_peer() {
        let mut cfg = base_config();
        cfg.peers = vec!["not-an-endpoint".into()];
        let v = validate_config(&cfg);
        assert!(!v.valid);
    }

    #[test]
    fn host_port_parsing() {
        assert!(looks_like_host_port("127.0.0.1:9000"));
        assert!(looks_like_host_port("chat.example.org:443"));
        assert!(!looks_like_host_port("9000"));
        assert!(!looks_like_host_port(":9000"));
        assert!(!looks_like_host_port("host:notaport"));
    }
}
