//! Session layer configuration

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::peer::PeerCode;
use crate::{DEFAULT_BASE_PORT, DEFAULT_PORT_ATTEMPTS};

/// Session layer configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Code of the local peer
    pub local_code: PeerCode,

    /// Session server configuration
    pub server: ServerConfig,

    /// Identification handshake configuration
    pub identity: IdentityConfig,

    /// File transfer configuration
    pub transfer: TransferConfig,

    /// Unknown-sender resolution configuration
    pub resolution: ResolutionConfig,
}

impl SessionConfig {
    /// Default configuration for the given local peer
    pub fn new(local_code: PeerCode) -> Self {
        Self {
            local_code,
            server: ServerConfig::default(),
            identity: IdentityConfig::default(),
            transfer: TransferConfig::default(),
            resolution: ResolutionConfig::default(),
        }
    }

    /// Check every nested section.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.identity.validate()?;
        self.transfer.validate()?;
        self.resolution.validate()?;
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Session server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the session listener on
    pub bind_ip: IpAddr,

    /// First port tried
    pub base_port: u16,

    /// Number of consecutive ports tried before giving up
    pub port_attempts: u16,

    /// Maximum identifications running at once; extra sockets are dropped
    pub max_pending_identifications: usize,

    /// Outbound connect timeout
    pub connect_timeout: Duration,
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.port_attempts == 0 {
            return Err(SessionError::invalid_config("port_attempts must be at least 1"));
        }
        if self.base_port == 0 {
            return Err(SessionError::invalid_config("base_port must be non-zero"));
        }
        if self.max_pending_identifications == 0 {
            return Err(SessionError::invalid_config(
                "max_pending_identifications must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: DEFAULT_BASE_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            max_pending_identifications: 64,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Identification handshake configuration
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Granularity of the identity wait
    pub poll_interval: Duration,

    /// Number of intervals before the claim is abandoned
    pub max_polls: u32,
}

impl IdentityConfig {
    /// Total time an inbound connection has to identify itself
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_polls)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout().is_zero() {
            return Err(SessionError::invalid_config("identity timeout must be non-zero"));
        }
        Ok(())
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_polls: 50, // 2.5 s
        }
    }
}

/// File transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Directory received files are written to
    pub download_dir: PathBuf,

    /// Read/write chunk size while streaming
    pub chunk_size: usize,

    /// Minimum time between progress callbacks
    pub progress_interval: Duration,

    /// Window used to sample throughput
    pub speed_window: Duration,

    /// How long a receiver waits for the sender to connect
    pub accept_timeout: Duration,

    /// Timeout for each protocol step (header, READY, DONE)
    pub handshake_timeout: Duration,

    /// Connect attempts made by the sender
    pub connect_attempts: u32,

    /// Delay between connect attempts (doubles each retry)
    pub connect_backoff: Duration,
}

impl TransferConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SessionError::invalid_config("chunk_size must be non-zero"));
        }
        if self.connect_attempts == 0 {
            return Err(SessionError::invalid_config("connect_attempts must be at least 1"));
        }
        if self.speed_window.is_zero() {
            return Err(SessionError::invalid_config("speed_window must be non-zero"));
        }
        Ok(())
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            chunk_size: 64 * 1024, // 64 KiB
            progress_interval: Duration::from_millis(250),
            speed_window: Duration::from_secs(2),
            accept_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            connect_attempts: 5,
            connect_backoff: Duration::from_millis(50),
        }
    }
}

/// Unknown-sender resolution configuration
#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    /// How often the directory is re-checked
    pub poll_interval: Duration,

    /// Number of checks before the event is dropped
    pub max_polls: u32,

    /// Maximum events waiting at once; extra events are dropped
    pub max_pending: usize,
}

impl ResolutionConfig {
    /// Total time an event may wait for its sender to become known
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_polls)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(SessionError::invalid_config("resolution poll_interval must be non-zero"));
        }
        if self.max_pending == 0 {
            return Err(SessionError::invalid_config("resolution max_pending must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_polls: 40, // 2 s
            max_pending: 256,
        }
    }
}
