use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::FILE_MAX_SIZE;
use crate::error::{Result, TftpError};

/// Well-known TFTP port (RFC 1350)
pub const TFTP_PORT: u16 = 69;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    /// Host or address to bind; wildcard when unset
    pub bind_host: Option<String>,
    pub port: u16,
    /// Largest file served; capped by the 16-bit block space
    pub max_file_size_bytes: u64,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    pub process: ProcessConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/tftpd"),
            bind_host: None,
            port: TFTP_PORT,
            max_file_size_bytes: FILE_MAX_SIZE,
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

/// Session table and retransmission tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the session table, portal included
    pub max_sessions: usize,
    /// First retransmission interval; doubles on every retry
    pub initial_retransmit_ms: u64,
    pub max_retransmits: u32,
    /// Scheduler quantum while any session waits for an ACK
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 500,
            initial_retransmit_ms: 500,
            max_retransmits: 5,
            poll_interval_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn initial_retransmit(&self) -> Duration {
        Duration::from_millis(self.initial_retransmit_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Log destination; stderr when unset
    pub file: Option<PathBuf>,
    /// Emit structured JSON audit events for requests and transfers
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per line for log aggregators
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Detach from the terminal before serving
    pub daemonize: bool,
    /// Confine the process to root_dir once the portal is bound
    pub chroot: bool,
    pub pid_file: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate configuration before any socket is opened.
///
/// With `validate_bind` the service address is test-bound as well.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Config(format!("root_dir is not readable: {}", e)));
    }

    if config.port == 0 {
        return Err(TftpError::Config("port must be non-zero".to_string()));
    }

    if validate_bind {
        let host = config
            .bind_host
            .as_deref()
            .unwrap_or(crate::transport::WILDCARD_HOST);
        if let Err(e) = std::net::UdpSocket::bind((host, config.port)) {
            return Err(TftpError::Config(format!(
                "bind address {}:{} is not available: {}",
                host, config.port, e
            )));
        }
    }

    if config.max_file_size_bytes == 0 || config.max_file_size_bytes > FILE_MAX_SIZE {
        return Err(TftpError::Config(format!(
            "max_file_size_bytes must be in range 1-{}",
            FILE_MAX_SIZE
        )));
    }

    validate_session_config(&config.session)?;

    if let Some(ref log_file) = config.logging.file {
        validate_parent_dir(log_file, "logging.file")?;
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| TftpError::Config(format!("logging.file not writable: {}", e)))?;
    }

    if let Some(ref pid_file) = config.process.pid_file {
        validate_parent_dir(pid_file, "process.pid_file")?;
    }

    Ok(())
}

pub fn validate_session_config(config: &SessionConfig) -> Result<()> {
    // one slot for the portal, at least one for a transfer
    if config.max_sessions < 2 {
        return Err(TftpError::Config(
            "session.max_sessions must be at least 2".to_string(),
        ));
    }

    if config.initial_retransmit_ms == 0 || config.poll_interval_ms == 0 {
        return Err(TftpError::Config(
            "session intervals must be non-zero".to_string(),
        ));
    }

    if config.poll_interval_ms > config.initial_retransmit_ms {
        return Err(TftpError::Config(
            "session.poll_interval_ms must not exceed session.initial_retransmit_ms".to_string(),
        ));
    }

    Ok(())
}

fn validate_parent_dir(path: &Path, field: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| TftpError::Config(format!("{} must include a parent directory", field)))?;
    match std::fs::metadata(parent) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TftpError::Config(format!(
            "{} parent must be a directory",
            field
        ))),
        Err(e) => Err(TftpError::Config(format!("{} parent error: {}", field, e))),
    }
}
