//! Configuration file for the `lanchat` binary.
//!
//! The presence layer is not part of this program, so the peer table that it
//! would normally populate is read from the `[[peers]]` section instead.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lanchat_core::{MemoryDirectory, Peer, PeerCode, SessionConfig};
use serde::{Deserialize, Serialize};

/// LanChat configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Local identity
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Static peer table
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

/// Local identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Local peer code
    #[serde(default)]
    pub code: PeerCode,
    /// Local nickname
    #[serde(default = "default_nick")]
    pub nick: String,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the session server binds on
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// First session port tried
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Consecutive ports tried before giving up
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Where received files are stored
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Peer code
    pub code: PeerCode,
    /// Nickname
    pub nick: String,
    /// Last-known address
    pub ip: String,
    /// Presence port
    #[serde(default = "default_presence_port")]
    pub presence_port: u16,
    /// Session server port, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_port: Option<u16>,
}

// Default values

fn default_nick() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string())
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_base_port() -> u16 {
    lanchat_core::DEFAULT_BASE_PORT
}

fn default_port_attempts() -> u16 {
    lanchat_core::DEFAULT_PORT_ATTEMPTS
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64 KiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_presence_port() -> u16 {
    6789
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            code: 0,
            nick: default_nick(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            base_port: default_base_port(),
            port_attempts: default_port_attempts(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("lanchat/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.network
            .bind_ip
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", self.network.bind_ip))?;

        if self.network.port_attempts == 0 {
            anyhow::bail!("port_attempts must be at least 1");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > 16 * 1024 * 1024 {
            anyhow::bail!("Chunk size must be between 1 and 16MB");
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if peer.code == self.identity.code {
                anyhow::bail!("Peer {} uses the local peer code", peer.nick);
            }
            if !seen.insert(peer.code) {
                anyhow::bail!("Duplicate peer code {}", peer.code);
            }
            peer.ip
                .parse::<IpAddr>()
                .map_err(|_| anyhow::anyhow!("Peer {} has invalid address: {}", peer.nick, peer.ip))?;
            if peer.session_port == Some(0) {
                anyhow::bail!("Peer {} has invalid session port: 0", peer.nick);
            }
        }

        Ok(())
    }

    /// Session layer configuration derived from this file
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address cannot be parsed.
    pub fn to_session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut session = SessionConfig::new(self.identity.code);
        session.server.bind_ip = self.network.bind_ip.parse()?;
        session.server.base_port = self.network.base_port;
        session.server.port_attempts = self.network.port_attempts;
        session.transfer.download_dir = self.transfer.download_dir.clone();
        session.transfer.chunk_size = self.transfer.chunk_size;
        Ok(session)
    }

    /// Directory populated from the local identity and the peer table.
    ///
    /// The local record is where the session server publishes its bound
    /// port.
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be parsed.
    pub fn directory(&self) -> anyhow::Result<Arc<MemoryDirectory>> {
        let directory = MemoryDirectory::new();
        directory.insert(Peer::new(
            self.identity.code,
            self.identity.nick.clone(),
            self.network.bind_ip.parse()?,
            default_presence_port(),
        ));
        for entry in &self.peers {
            let mut peer = Peer::new(entry.code, entry.nick.clone(), entry.ip.parse()?, entry.presence_port);
            if let Some(port) = entry.session_port {
                peer = peer.with_session_port(port);
            }
            directory.insert(peer);
        }
        Ok(Arc::new(directory))
    }
}
