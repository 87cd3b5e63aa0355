use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::Platform;
use crate::error::ConfigError;

/// Directory holding config, pid and log files (`~/.config/devicehub`)
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
    let dir = base_dirs.config_dir().join("devicehub");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json"))
}

/// Expand `~` and `$VAR` in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

/// Timeouts and polling periods, all configurable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Agent inactivity before its connection counts as lost
    pub read_secs: u64,
    /// Wait for the response to one device action
    pub action_secs: u64,
    /// Wait for one RPC call on a node
    pub rpc_call_secs: u64,
    pub ping_interval_secs: u64,
    /// A node whose last successful ping is older than this is disconnected
    pub ping_stale_secs: u64,
    pub session_idle_secs: u64,
    pub session_sweep_ms: u64,
    pub refresh_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read_secs: 120,
            action_secs: 20,
            rpc_call_secs: 60,
            ping_interval_secs: 5,
            ping_stale_secs: 30,
            session_idle_secs: 60,
            session_sweep_ms: 50,
            refresh_ms: 50,
        }
    }
}

impl Timeouts {
    /// Every field by its config name
    fn fields(&self) -> [(&'static str, u64); 8] {
        [
            ("readSecs", self.read_secs),
            ("actionSecs", self.action_secs),
            ("rpcCallSecs", self.rpc_call_secs),
            ("pingIntervalSecs", self.ping_interval_secs),
            ("pingStaleSecs", self.ping_stale_secs),
            ("sessionIdleSecs", self.session_idle_secs),
            ("sessionSweepMs", self.session_sweep_ms),
            ("refreshMs", self.refresh_ms),
        ]
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn action(&self) -> Duration {
        Duration::from_secs(self.action_secs)
    }

    pub fn rpc_call(&self) -> Duration {
        Duration::from_secs(self.rpc_call_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_stale(&self) -> Duration {
        Duration::from_secs(self.ping_stale_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn session_sweep(&self) -> Duration {
        Duration::from_millis(self.session_sweep_ms)
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }
}

/// Shell command templates for one platform; unset means unsupported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformCommands {
    /// Prints one line per available device, device id as first token
    pub list: Option<String>,
    pub start_device: Option<String>,
    pub stop_device: Option<String>,
    pub is_installed: Option<String>,
    pub install: Option<String>,
    pub uninstall: Option<String>,
    pub start_app: Option<String>,
    pub stop_app: Option<String>,
    /// Prints an encoded PNG or JPEG on stdout
    pub screenshot: Option<String>,
    pub start_recording: Option<String>,
    pub execute: Option<String>,
    /// Receives the script on stdin
    pub native_script: Option<String>,
    pub tap: Option<String>,
}

impl PlatformCommands {
    /// Fill unset templates from `defaults`
    pub fn or(self, defaults: PlatformCommands) -> PlatformCommands {
        PlatformCommands {
            list: self.list.or(defaults.list),
            start_device: self.start_device.or(defaults.start_device),
            stop_device: self.stop_device.or(defaults.stop_device),
            is_installed: self.is_installed.or(defaults.is_installed),
            install: self.install.or(defaults.install),
            uninstall: self.uninstall.or(defaults.uninstall),
            start_app: self.start_app.or(defaults.start_app),
            stop_app: self.stop_app.or(defaults.stop_app),
            screenshot: self.screenshot.or(defaults.screenshot),
            start_recording: self.start_recording.or(defaults.start_recording),
            execute: self.execute.or(defaults.execute),
            native_script: self.native_script.or(defaults.native_script),
            tap: self.tap.or(defaults.tap),
        }
    }
}

/// A device declared in the config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub os_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub commands: PlatformCommands,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Overrides the platform's default connection timeout
    #[serde(default)]
    pub connection_timeout_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Node identifier reported to the master; defaults to the hostname
    #[serde(default)]
    pub identifier: String,
    /// `host:port` of the master's HTTP endpoint
    #[serde(default = "default_master_url")]
    pub master_url: String,
    /// `host:port` apps on this machine connect their agent to
    #[serde(default)]
    pub node_url: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_device_port")]
    pub device_port: u16,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// App binaries served to nodes (master)
    #[serde(default = "default_app_dir")]
    pub app_dir: String,
    /// Uploaded app binaries (node)
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: String,
    /// Session screen recordings
    #[serde(default = "default_recording_dir")]
    pub recording_dir: String,
    #[serde(default)]
    pub managers: HashMap<String, ManagerConfig>,
}

fn default_master_url() -> String {
    "127.0.0.1:8002".to_string()
}

fn default_http_port() -> u16 {
    8002
}

fn default_device_port() -> u16 {
    3939
}

fn default_app_dir() -> String {
    "~/.local/share/devicehub/apps".to_string()
}

fn default_bundle_dir() -> String {
    "~/.local/share/devicehub/bundles".to_string()
}

fn default_recording_dir() -> String {
    "~/.local/share/devicehub/recordings".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            master_url: default_master_url(),
            node_url: String::new(),
            http_port: default_http_port(),
            device_port: default_device_port(),
            timeouts: Timeouts::default(),
            app_dir: default_app_dir(),
            bundle_dir: default_bundle_dir(),
            recording_dir: default_recording_dir(),
            managers: HashMap::new(),
        }
    }
}

impl HubConfig {
    /// Load from `path`, or the default location; a missing file yields defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str::<HubConfig>(&content)?
        } else {
            HubConfig::default()
        };

        if config.identifier.is_empty() {
            config.identifier = hostname();
        }
        if config.node_url.is_empty() {
            config.node_url = format!("127.0.0.1:{}", config.device_port);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self.managers.keys() {
            if Platform::from_manager_name(name).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "unknown manager '{}'",
                    name
                )));
            }
        }
        // periods feed tokio::time::interval, which rejects zero
        if let Some((name, _)) = self.timeouts.fields().into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ValidationError(format!(
                "timeouts.{} must be greater than zero",
                name
            )));
        }
        if self.timeouts.ping_stale_secs < self.timeouts.ping_interval_secs {
            return Err(ConfigError::ValidationError(
                "pingStaleSecs must not be shorter than pingIntervalSecs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn app_dir(&self) -> PathBuf {
        expand_path(&self.app_dir)
    }

    pub fn bundle_dir(&self) -> PathBuf {
        expand_path(&self.bundle_dir)
    }

    pub fn recording_dir(&self) -> PathBuf {
        expand_path(&self.recording_dir)
    }

    /// Enabled managers in a stable order
    pub fn enabled_managers(&self) -> Vec<(Platform, &ManagerConfig)> {
        let mut managers: Vec<_> = self
            .managers
            .iter()
            .filter(|(_, m)| m.enabled)
            .filter_map(|(name, m)| Platform::from_manager_name(name).map(|p| (p, m)))
            .collect();
        managers.sort_by_key(|(p, _)| p.manager_name());
        managers
    }
}

/// Host name of this machine, or a fixed fallback
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "devicehub-node".to_string())
}
