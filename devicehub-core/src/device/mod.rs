//! Device contract shared by local platform devices and node proxies.

pub mod command;
pub mod connection;
pub mod base;
pub mod handler;
pub mod local;

pub use base::{ActionGuard, DeviceCore, DeviceDetails, HandlerId};
pub use connection::{Connection, Inbound, DEFAULT_READ_TIMEOUT};
pub use handler::{DeviceHandler, StaticHandler};
pub use local::{LocalDevice, Platform};

use async_trait::async_trait;
use devicehub_protocol::action::{LogData, LogLevel, PerformanceData};
use devicehub_protocol::{AppParameter, DeviceInfo, Response};
use std::time::Duration;
use tracing::{error, info};

use crate::error::Result;

/// Encoded screenshot with its pixel dimensions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenshotData {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A device the hub can drive, wherever it is attached
#[async_trait]
pub trait Device: Send + Sync {
    fn core(&self) -> &DeviceCore;

    /// Name of the handler that owns this device
    fn manager(&self) -> &str;

    fn device_id(&self) -> &str {
        self.core().id()
    }

    async fn info(&self) -> DeviceInfo {
        self.core().info().await
    }

    async fn is_app_installed(&self, app: &AppParameter) -> Result<bool>;
    async fn install_app(&self, app: &AppParameter) -> Result<()>;
    async fn uninstall_app(&self, app: &AppParameter) -> Result<()>;

    /// Launch the app; `node_url` is where its agent should connect back to
    async fn start_app(&self, app: &AppParameter, session_id: &str, node_url: &str) -> Result<()>;
    async fn stop_app(&self, app: &AppParameter) -> Result<()>;

    async fn start_recording(&self, path: &str) -> Result<()>;
    async fn stop_recording(&self) -> Result<()>;

    async fn get_screenshot(&self) -> Result<ScreenshotData>;
    async fn has_feature(&self, feature: &str) -> bool;
    async fn execute(&self, data: &str) -> Result<()>;
    async fn run_native_script(&self, script: &[u8]) -> Result<()>;

    /// How long a freshly started app may take to connect its agent
    async fn connection_timeout(&self) -> Duration;

    async fn is_app_connected(&self) -> bool {
        self.core().is_connected().await
    }

    /// Write an encoded action to the agent
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.core().send(&data).await
    }

    fn as_coordinate_tappable(&self) -> Option<&dyn CoordinateTappable> {
        None
    }
}

/// Devices that can tap raw screen coordinates without the agent
#[async_trait]
pub trait CoordinateTappable: Send + Sync {
    async fn tap(&self, x: i64, y: i64) -> Result<()>;
}

/// Receives every agent response while registered; `None` on disconnect
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn on_action_response(&self, device_id: &str, response: Option<&Response>);
}

/// Sink for device-originated log output
pub trait LogWriter: Send + Sync {
    fn log(&self, source: &str, message: &str);
    fn error(&self, source: &str, message: &str);
    /// A file produced by the device (screenshot, scene graph, recording)
    fn data(&self, source: &str, path: &str);
    fn performance(&self, perf: &PerformanceData, other: &str);

    fn app_log(&self, log: &LogData) {
        match log.level {
            LogLevel::Error | LogLevel::Exception => self.error("app", &log.message),
            _ => self.log("app", &log.message),
        }
    }
}

/// Default writer: forwards everything to `tracing`
pub struct TracingLogWriter {
    device_id: String,
}

impl TracingLogWriter {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
        }
    }
}

impl LogWriter for TracingLogWriter {
    fn log(&self, source: &str, message: &str) {
        info!("[{}] {}: {}", self.device_id, source, message);
    }

    fn error(&self, source: &str, message: &str) {
        error!("[{}] {}: {}", self.device_id, source, message);
    }

    fn data(&self, source: &str, path: &str) {
        info!("[{}] {}: data stored at {}", self.device_id, source, path);
    }

    fn performance(&self, perf: &PerformanceData, other: &str) {
        info!(
            "[{}] performance {}: cpu={:.1} fps={:.1} mem={:.1} vertices={} triangles={} {}",
            self.device_id,
            perf.checkpoint,
            perf.cpu,
            perf.fps,
            perf.memory,
            perf.vertex_count,
            perf.triangles,
            other
        );
    }
}

/// Filters used to pick a device for a new session; empty fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub os: Option<String>,
    pub manager: Option<String>,
}

impl DeviceProperties {
    pub fn by_id(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, manager: &str, info: &DeviceInfo) -> bool {
        fn check(filter: &Option<String>, value: &str) -> bool {
            filter
                .as_deref()
                .map_or(true, |f| f.is_empty() || f.eq_ignore_ascii_case(value))
        }

        check(&self.device_id, &info.device_id)
            && check(&self.name, &info.name)
            && check(&self.os, &info.os_name)
            && check(&self.manager, manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_match_case_insensitive() {
        let info = DeviceInfo {
            device_id: "emulator-5554".to_string(),
            name: "Pixel 7".to_string(),
            os_name: "Android".to_string(),
            ..Default::default()
        };

        assert!(DeviceProperties::default().matches("android_device", &info));
        assert!(DeviceProperties::by_id("emulator-5554").matches("android_device", &info));

        let props = DeviceProperties {
            os: Some("android".to_string()),
            manager: Some("android_device".to_string()),
            ..Default::default()
        };
        assert!(props.matches("android_device", &info));
        assert!(!props.matches("ios_sim", &info));
        assert!(!DeviceProperties::by_id("other").matches("android_device", &info));
    }
}
