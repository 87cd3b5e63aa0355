use async_trait::async_trait;
use devicehub_protocol::AppParameter;
use std::fmt;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::command::{self, CommandVars};
use super::{CoordinateTappable, Device, DeviceCore, DeviceDetails, ScreenshotData};
use crate::action::image_dimensions;
use crate::config::PlatformCommands;
use crate::error::{HubError, Result};

pub const FEATURE_BACK: &str = "back";

/// Kinds of locally attached devices, one handler each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    AndroidDevice,
    IosDevice,
    IosSimulator,
    MacOs,
    UnityEditor,
    Web,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::AndroidDevice,
        Platform::IosDevice,
        Platform::IosSimulator,
        Platform::MacOs,
        Platform::UnityEditor,
        Platform::Web,
    ];

    pub fn manager_name(&self) -> &'static str {
        match self {
            Platform::AndroidDevice => "android_device",
            Platform::IosDevice => "ios_device",
            Platform::IosSimulator => "ios_sim",
            Platform::MacOs => "macos",
            Platform::UnityEditor => "unity_editor",
            Platform::Web => "web",
        }
    }

    pub fn from_manager_name(name: &str) -> Option<Platform> {
        Self::ALL.into_iter().find(|p| p.manager_name() == name)
    }

    pub fn os_name(&self) -> &'static str {
        match self {
            Platform::AndroidDevice => "Android",
            Platform::IosDevice | Platform::IosSimulator => "iOS",
            Platform::MacOs => "macOS",
            Platform::UnityEditor => "Unity",
            Platform::Web => "Web",
        }
    }

    pub fn default_connection_timeout(&self) -> Duration {
        match self {
            Platform::AndroidDevice | Platform::IosDevice => Duration::from_secs(2 * 60),
            Platform::IosSimulator | Platform::MacOs | Platform::Web => Duration::from_secs(10),
            Platform::UnityEditor => Duration::from_secs(60 * 60),
        }
    }

    pub fn features(&self) -> &'static [&'static str] {
        match self {
            Platform::AndroidDevice => &[FEATURE_BACK],
            _ => &[],
        }
    }

    /// Built-in templates; only Android ships with a usable default set
    pub fn default_commands(&self) -> PlatformCommands {
        match self {
            Platform::AndroidDevice => PlatformCommands {
                list: Some("adb devices".to_string()),
                is_installed: Some("adb -s {device} shell pm path {identifier}".to_string()),
                install: Some("adb -s {device} install -r {path}".to_string()),
                uninstall: Some("adb -s {device} uninstall {identifier}".to_string()),
                start_app: Some(
                    "adb -s {device} shell am start -n {identifier}/{activity} \
                     --es SESSION_ID {session} --es NODE_URL {node_url}"
                        .to_string(),
                ),
                stop_app: Some("adb -s {device} shell am force-stop {identifier}".to_string()),
                screenshot: Some("adb -s {device} exec-out screencap -p".to_string()),
                start_recording: Some(
                    "adb -s {device} shell screenrecord --time-limit 180 {path}".to_string(),
                ),
                execute: Some("adb -s {device} shell {data}".to_string()),
                tap: Some("adb -s {device} shell input tap {x} {y}".to_string()),
                ..Default::default()
            },
            _ => PlatformCommands::default(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.manager_name())
    }
}

/// A device attached to this machine, driven through platform tool commands
pub struct LocalDevice {
    core: DeviceCore,
    platform: Platform,
    commands: PlatformCommands,
    connection_timeout: Duration,
    recorder: Mutex<Option<Child>>,
}

impl LocalDevice {
    pub fn new(
        platform: Platform,
        id: impl Into<String>,
        details: DeviceDetails,
        commands: PlatformCommands,
    ) -> Self {
        Self {
            core: DeviceCore::new(id, details),
            platform,
            commands,
            connection_timeout: platform.default_connection_timeout(),
            recorder: Mutex::new(None),
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn commands(&self) -> &PlatformCommands {
        &self.commands
    }

    fn vars(&self) -> CommandVars {
        CommandVars::new().set("device", self.core.id())
    }

    fn app_vars(&self, app: &AppParameter) -> CommandVars {
        let mut vars = self
            .vars()
            .set("identifier", app.identifier.as_str())
            .set("activity", app.launch_activity().unwrap_or_default());
        if let Some(params) = &app.app {
            vars = vars.set("path", params.app_path.as_str());
        }
        if let Some(web) = &app.web {
            vars = vars.set("url", web.start_url.as_str());
        }
        vars
    }

    fn template<'a>(&self, operation: &str, template: &'a Option<String>) -> Result<&'a str> {
        template.as_deref().ok_or_else(|| {
            HubError::Unsupported(format!("{} on {}", operation, self.platform.manager_name()))
        })
    }
}

#[async_trait]
impl Device for LocalDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn manager(&self) -> &str {
        self.platform.manager_name()
    }

    async fn is_app_installed(&self, app: &AppParameter) -> Result<bool> {
        if self.platform == Platform::Web {
            return Ok(true);
        }
        let template = self.template("is_app_installed", &self.commands.is_installed)?;
        command::succeeds(template, &self.app_vars(app)).await
    }

    async fn install_app(&self, app: &AppParameter) -> Result<()> {
        if self.platform == Platform::Web {
            return Ok(());
        }
        if app.app.as_ref().map_or(true, |a| a.app_path.is_empty()) {
            return Err(HubError::Command(format!(
                "no app binary available for {}",
                app.identifier
            )));
        }
        let template = self.template("install_app", &self.commands.install)?;
        command::run(template, &self.app_vars(app)).await?;
        info!("Installed {} on {}", app.identifier, self.core.id());
        Ok(())
    }

    async fn uninstall_app(&self, app: &AppParameter) -> Result<()> {
        if self.platform == Platform::Web {
            return Ok(());
        }
        let template = self.template("uninstall_app", &self.commands.uninstall)?;
        command::run(template, &self.app_vars(app)).await?;
        Ok(())
    }

    async fn start_app(&self, app: &AppParameter, session_id: &str, node_url: &str) -> Result<()> {
        let template = self.template("start_app", &self.commands.start_app)?;
        let vars = self
            .app_vars(app)
            .set("session", session_id)
            .set("node_url", node_url);
        command::run(template, &vars).await?;
        info!(
            "Started {} on {} for session {}",
            app.identifier,
            self.core.id(),
            session_id
        );
        Ok(())
    }

    async fn stop_app(&self, app: &AppParameter) -> Result<()> {
        let template = self.template("stop_app", &self.commands.stop_app)?;
        command::run(template, &self.app_vars(app)).await?;
        Ok(())
    }

    async fn start_recording(&self, path: &str) -> Result<()> {
        let template = self.template("start_recording", &self.commands.start_recording)?;
        let child = command::spawn(template, &self.vars().set("path", path))?;

        let previous = self.recorder.lock().await.replace(child);
        if let Some(mut previous) = previous {
            warn!("Replacing running recorder on {}", self.core.id());
            let _ = previous.kill().await;
        }
        Ok(())
    }

    async fn stop_recording(&self) -> Result<()> {
        let Some(mut child) = self.recorder.lock().await.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        Ok(())
    }

    async fn get_screenshot(&self) -> Result<ScreenshotData> {
        let template = self.template("get_screenshot", &self.commands.screenshot)?;
        let data = command::run(template, &self.vars()).await?;
        let (width, height) = image_dimensions(&data).ok_or_else(|| {
            HubError::UnexpectedResponse("screenshot is not a PNG or JPEG image".to_string())
        })?;
        Ok(ScreenshotData {
            data,
            width,
            height,
        })
    }

    async fn has_feature(&self, feature: &str) -> bool {
        self.platform.features().contains(&feature)
    }

    async fn execute(&self, data: &str) -> Result<()> {
        let template = self.template("execute", &self.commands.execute)?;
        command::run(template, &self.vars().set("data", data)).await?;
        Ok(())
    }

    async fn run_native_script(&self, script: &[u8]) -> Result<()> {
        let template = self.template("run_native_script", &self.commands.native_script)?;
        command::run_with_input(template, &self.vars(), Some(script)).await?;
        Ok(())
    }

    async fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    fn as_coordinate_tappable(&self) -> Option<&dyn CoordinateTappable> {
        if self.commands.tap.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl CoordinateTappable for LocalDevice {
    async fn tap(&self, x: i64, y: i64) -> Result<()> {
        let template = self.template("tap", &self.commands.tap)?;
        let vars = self
            .vars()
            .set("x", x.to_string())
            .set("y", y.to_string());
        command::run(template, &vars).await?;
        Ok(())
    }
}
