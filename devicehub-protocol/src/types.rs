use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a device as seen by its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Unknown,
    Shutdown,
    RemoteDisconnected,
    Booted,
    Locked,
    /// The node hosting this device stopped reporting it
    NodeDisconnected,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState::Unknown
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Unknown => write!(f, "unknown"),
            DeviceState::Shutdown => write!(f, "shutdown"),
            DeviceState::RemoteDisconnected => write!(f, "remote disconnected"),
            DeviceState::Booted => write!(f, "booted"),
            DeviceState::Locked => write!(f, "locked"),
            DeviceState::NodeDisconnected => write!(f, "node disconnected"),
        }
    }
}

/// Whether the on-device agent currently holds a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Descriptive snapshot of a device, as reported over RPC
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub state: DeviceState,
    #[serde(default)]
    pub connection_state: ConnectionState,
}

/// Platform of the app under test, carried with app parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppPlatform {
    Android,
    Ios,
    MacOs,
    Windows,
    Linux,
    Web,
    Editor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AndroidParams {
    #[serde(default)]
    pub launch_activity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutableParams {
    #[serde(default)]
    pub executable: String,
}

/// Binary artifact of an app build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppParams {
    #[serde(default)]
    pub app_id: u32,
    #[serde(default)]
    pub app_path: String,
    #[serde(default)]
    pub additional: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android: Option<AndroidParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<ExecutableParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebParams {
    #[serde(rename = "startURL", default)]
    pub start_url: String,
}

/// Everything a device needs to install and launch an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppParameter {
    pub platform: AppPlatform,
    #[serde(default)]
    pub name: String,
    /// Bundle id or package name
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<AppParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebParams>,
}

impl AppParameter {
    /// Content hash of the binary, empty for web apps
    pub fn hash(&self) -> &str {
        self.app.as_ref().map(|a| a.hash.as_str()).unwrap_or("")
    }

    pub fn launch_activity(&self) -> Option<&str> {
        self.app
            .as_ref()
            .and_then(|a| a.android.as_ref())
            .map(|a| a.launch_activity.as_str())
            .filter(|s| !s.is_empty())
    }
}
