//! Configuration for the RDP listener daemon.

use std::path::{Path, PathBuf};

use rdpd_core::{CryptLevel, RdpError, ServerConfig, ServerContext, ServerKeys};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Protocol policy handed to every connection.
    pub rdp: ServerConfig,
    /// Key material for standard RDP security.
    pub keys: KeysConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the listener to.
    pub listen_address: String,
    /// TCP port for RDP clients.
    pub port: u16,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Seconds a client has to complete the connection sequence.
    pub connect_timeout_secs: u64,
}

/// Where the RSA key pair comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// TOML key file; empty means no file.
    pub key_file: PathBuf,
    /// Fall back to a publicly known key when no file is configured.
    pub allow_development_key: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".into(),
            port: 3389,
            max_connections: 16,
            connect_timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl DaemonConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.listen_address, self.network.port)
    }

    /// Build the shared per-listener context: policy plus keys.
    pub fn to_context(&self) -> Result<ServerContext, RdpError> {
        let keys = if !self.keys.key_file.as_os_str().is_empty() {
            Some(ServerKeys::load(&self.keys.key_file)?)
        } else if self.keys.allow_development_key {
            tracing::warn!("using the insecure development RSA key");
            Some(ServerKeys::insecure_development_key())
        } else {
            None
        };

        let ctx = ServerContext::new(self.rdp.clone());
        let ctx = match keys {
            Some(keys) => ctx.with_keys(keys),
            None if self.rdp.crypt_level != CryptLevel::None => {
                return Err(RdpError::Config(
                    "crypt_level requires keys.key_file or keys.allow_development_key".into(),
                ));
            }
            None => ctx,
        };
        Ok(ctx)
    }
}

// ── Tests ────────────────────────────────────────────────────────
