//! Configuration management for Perun.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{DEFAULT_DMR_PORT, DEFAULT_PARROT_ID};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// DMR server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Repeater registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Identity snapshot configuration.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.dmr_port == 0 {
            return Err(Error::InvalidConfig("dmr_port must be non-zero".into()));
        }

        if self.server.read_buffer == 0 || self.server.write_buffer == 0 {
            return Err(Error::InvalidConfig(
                "socket buffer sizes must be non-zero".into(),
            ));
        }

        if self.server.parrot_id == 0 {
            return Err(Error::InvalidConfig("parrot_id must be non-zero".into()));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("net", "perun", "perun").map_or_else(
            || PathBuf::from("perun.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                debug: false,
                ..Default::default()
            },
            registry: RegistryConfig {
                db_path: PathBuf::from("/var/lib/perun/registry.db"),
            },
            identity: IdentityConfig {
                snapshot: Some(PathBuf::from("/var/lib/perun/users.json")),
            },
            ..Default::default()
        }
    }
}

/// DMR server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the UDP socket to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// UDP port for the Home-Brew protocol.
    #[serde(default = "default_dmr_port")]
    pub dmr_port: u16,

    /// Socket receive buffer size in bytes.
    #[serde(default = "default_buffer")]
    pub read_buffer: usize,

    /// Socket send buffer size in bytes.
    #[serde(default = "default_buffer")]
    pub write_buffer: usize,

    /// Reserved radio id of the parrot echo service.
    #[serde(default = "default_parrot_id")]
    pub parrot_id: u32,

    /// Evict sessions that miss heartbeats for this long.
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Finalize calls with no bursts for this long.
    #[serde(default = "default_call_inactivity", with = "humantime_serde")]
    pub call_inactivity: Duration,

    /// Start parrot playback after this much stream silence.
    #[serde(default = "default_parrot_inactivity", with = "humantime_serde")]
    pub parrot_inactivity: Duration,

    /// Evict sessions that stall before completing authentication.
    #[serde(default = "default_login_timeout", with = "humantime_serde")]
    pub login_timeout: Duration,

    /// Interval of the session eviction sweep.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Grace period bounding graceful shutdown.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Enable verbose per-packet logging.
    #[serde(default)]
    pub debug: bool,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_dmr_port() -> u16 {
    DEFAULT_DMR_PORT
}
fn default_buffer() -> usize {
    1024 * 1024
}
fn default_parrot_id() -> u32 {
    DEFAULT_PARROT_ID
}
fn default_ping_timeout() -> Duration {
    Duration::from_secs(90)
}
fn default_call_inactivity() -> Duration {
    Duration::from_secs(2)
}
fn default_parrot_inactivity() -> Duration {
    Duration::from_secs(1)
}
fn default_login_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

impl ServerConfig {
    /// The socket address the server binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.dmr_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            dmr_port: default_dmr_port(),
            read_buffer: default_buffer(),
            write_buffer: default_buffer(),
            parrot_id: default_parrot_id(),
            ping_timeout: default_ping_timeout(),
            call_inactivity: default_call_inactivity(),
            parrot_inactivity: default_parrot_inactivity(),
            login_timeout: default_login_timeout(),
            sweep_interval: default_sweep_interval(),
            shutdown_grace: default_shutdown_grace(),
            debug: false,
        }
    }
}

/// Repeater registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Path to the SQLite registry database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("perun.db")
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Identity snapshot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Path to the radio-id users JSON snapshot. Absent means no
    /// callsign verification.
    pub snapshot: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path.
    pub file: Option<PathBuf>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.dmr_port, DEFAULT_DMR_PORT);
        assert_eq!(config.server.parrot_id, DEFAULT_PARROT_ID);
        assert_eq!(config.server.read_buffer, 1024 * 1024);
        assert_eq!(config.server.ping_timeout, Duration::from_secs(90));
        assert_eq!(config.server.call_inactivity, Duration::from_secs(2));
        assert_eq!(config.server.parrot_inactivity, Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::example();
        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: Config = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.server.dmr_port, config.server.dmr_port);
        assert_eq!(decoded.registry.db_path, config.registry.db_path);
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let mut config = Config::default();
        config.server.dmr_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [server]
            dmr_port = 52000
            ping_timeout = "30s"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.dmr_port, 52000);
        assert_eq!(config.server.ping_timeout, Duration::from_secs(30));
        assert_eq!(config.server.parrot_id, DEFAULT_PARROT_ID);
    }
}
