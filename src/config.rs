use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::kiosk::{KioskSettings, PolicyKey, default_shell_processes, default_system_processes};
use crate::platform::common::{atomic_write, data_dir, set_owner_only};
use crate::protocol::{ConnectionSettings, ReconnectPolicy};

/// Agent configuration, stored as TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub kiosk: KioskConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Where the controller lives and how hard to try reaching it
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for a TCP connect
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Seconds before the first reconnect attempt; doubles per attempt
    #[serde(default = "default_base_reconnect_delay")]
    pub base_reconnect_delay: u64,

    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: u64,

    /// Seconds between attempts while the first connect has not succeeded
    #[serde(default = "default_initial_retry_interval")]
    pub initial_retry_interval: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_base_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_delay() -> u64 {
    60
}

fn default_initial_retry_interval() -> u64 {
    5
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_reconnect_delay: default_base_reconnect_delay(),
            max_reconnect_delay: default_max_reconnect_delay(),
            initial_retry_interval: default_initial_retry_interval(),
        }
    }
}

impl ConnectionConfig {
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            reconnect: ReconnectPolicy {
                base: Duration::from_secs(self.base_reconnect_delay),
                cap: Duration::from_secs(self.max_reconnect_delay),
                max_attempts: self.max_reconnect_attempts,
            },
            ..ConnectionSettings::default()
        }
    }
}

/// Lockdown and enforcement settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct KioskConfig {
    /// Seconds between enforcement sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Process names that are never terminated
    #[serde(default = "default_system_processes")]
    pub system_processes: Vec<String>,

    /// System processes whose children are judged on their own, so that a
    /// shell cannot pass exemption on to what it launches
    #[serde(default = "default_shell_processes")]
    pub shell_processes: Vec<String>,

    /// PIDs below this are kernel or session infrastructure
    #[serde(default = "default_reserved_pid_threshold")]
    pub reserved_pid_threshold: u32,

    /// Spare processes whose direct parent is a system process
    #[serde(default = "default_true")]
    pub exempt_system_children: bool,

    #[serde(default = "default_policy_keys")]
    pub policy_keys: Vec<PolicyKey>,

    /// Seconds to wait for a launched app to exit when kiosk mode ends
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout: u64,

    /// Refuse to touch lockdown settings without administrator rights
    #[serde(default = "default_true")]
    pub require_admin: bool,

    /// Allowed apps file (defaults to the data directory)
    #[serde(default)]
    pub apps_file: Option<PathBuf>,

    /// Agent state file (defaults to the data directory)
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

fn default_sweep_interval() -> u64 {
    2
}

fn default_reserved_pid_threshold() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_policy_keys() -> Vec<PolicyKey> {
    PolicyKey::ALL.to_vec()
}

fn default_terminate_timeout() -> u64 {
    3
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            system_processes: default_system_processes(),
            shell_processes: default_shell_processes(),
            reserved_pid_threshold: default_reserved_pid_threshold(),
            exempt_system_children: true,
            policy_keys: default_policy_keys(),
            terminate_timeout: default_terminate_timeout(),
            require_admin: true,
            apps_file: None,
            state_file: None,
        }
    }
}

impl KioskConfig {
    pub fn settings(&self) -> KioskSettings {
        KioskSettings {
            policy_keys: self.policy_keys.clone(),
            system_processes: self.system_processes.clone(),
            shell_processes: self.shell_processes.clone(),
            reserved_pid_threshold: self.reserved_pid_threshold,
            exempt_system_children: self.exempt_system_children,
            terminate_timeout: Duration::from_secs(self.terminate_timeout),
            require_admin: self.require_admin,
            ..KioskSettings::default()
        }
    }

    pub fn sweep_every(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    pub fn apps_path(&self) -> Result<PathBuf> {
        match &self.apps_file {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("allowed_apps.json")),
        }
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("state.json")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Local attendant override
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct AdminConfig {
    /// Argon2 PHC string; see `kiosk-agent hash-password`
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file if present, otherwise the defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file readable only by its owner
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        set_owner_only(path)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let conn = &self.connection;

        if conn.host.trim().is_empty() {
            anyhow::bail!("connection.host cannot be empty");
        }
        if conn.port == 0 {
            anyhow::bail!("connection.port must be between 1 and 65535");
        }
        for (name, value) in [
            ("connection.connect_timeout", conn.connect_timeout),
            ("connection.heartbeat_interval", conn.heartbeat_interval),
            ("connection.base_reconnect_delay", conn.base_reconnect_delay),
            ("connection.initial_retry_interval", conn.initial_retry_interval),
            ("kiosk.sweep_interval", self.kiosk.sweep_interval),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be at least 1 second", name);
            }
        }
        if conn.base_reconnect_delay > conn.max_reconnect_delay {
            anyhow::bail!(
                "connection.base_reconnect_delay ({}) exceeds max_reconnect_delay ({})",
                conn.base_reconnect_delay,
                conn.max_reconnect_delay
            );
        }

        if self.kiosk.policy_keys.is_empty() {
            tracing::warn!("kiosk.policy_keys is empty; kiosk mode will not disable any system tools");
        }

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            anyhow::bail!("Invalid logging.level: {}", self.logging.level);
        }

        Ok(())
    }
}

/// Get the platform-specific agent config path
pub fn get_agent_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/kiosk-agent/agent.conf"))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(data_dir()?.join("agent.conf"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        directories::ProjectDirs::from("", "", "kiosk-agent")
            .map(|dirs| dirs.config_dir().join("agent.conf"))
            .context("Could not determine config directory")
    }
}
