use async_trait::async_trait;
use devicehub_protocol::DeviceState;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::command::{self, CommandVars};
use super::local::{LocalDevice, Platform};
use super::{Device, DeviceDetails};
use crate::config::{ManagerConfig, PlatformCommands};
use crate::error::{HubError, Result};

/// Minimum spacing between two runs of a handler's `list` command
const LIST_INTERVAL: Duration = Duration::from_secs(5);

/// Owns the devices of one platform (or of remote nodes)
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// Manager name this handler registers under
    fn name(&self) -> &str;

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn start_device(&self, device_id: &str) -> Result<()>;
    async fn stop_device(&self, device_id: &str) -> Result<()>;

    async fn devices(&self) -> Vec<Arc<dyn Device>>;

    /// Bring the device list and states up to date
    async fn refresh_devices(&self, force: bool) -> Result<()>;

    async fn has_device(&self, device_id: &str) -> bool {
        self.devices()
            .await
            .iter()
            .any(|d| d.device_id() == device_id)
    }
}

/// Serves the devices declared for one platform in the config file
///
/// Devices are marked booted or shut down from the output of the platform's
/// `list` command; without one they are assumed booted.
pub struct StaticHandler {
    platform: Platform,
    commands: PlatformCommands,
    devices: RwLock<Vec<Arc<LocalDevice>>>,
    last_list: Mutex<Option<Instant>>,
}

impl StaticHandler {
    pub fn new(platform: Platform, config: &ManagerConfig) -> Self {
        let commands = config.commands.clone().or(platform.default_commands());
        let timeout = config
            .connection_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| platform.default_connection_timeout());

        let devices = config
            .devices
            .iter()
            .map(|d| {
                let details = DeviceDetails {
                    name: if d.name.is_empty() { d.id.clone() } else { d.name.clone() },
                    model: d.model.clone(),
                    os_name: platform.os_name().to_string(),
                    os_version: d.os_version.clone(),
                };
                Arc::new(
                    LocalDevice::new(platform, d.id.clone(), details, commands.clone())
                        .with_connection_timeout(timeout),
                )
            })
            .collect();

        Self {
            platform,
            commands,
            devices: RwLock::new(devices),
            last_list: Mutex::new(None),
        }
    }

    async fn find(&self, device_id: &str) -> Result<Arc<LocalDevice>> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.core().id() == device_id)
            .cloned()
            .ok_or_else(|| HubError::DeviceNotFound(device_id.to_string()))
    }

    async fn due_for_listing(&self, force: bool) -> bool {
        let mut last = self.last_list.lock().await;
        let due = force || last.map_or(true, |t| t.elapsed() >= LIST_INTERVAL);
        if due {
            *last = Some(Instant::now());
        }
        due
    }
}

/// First whitespace-separated token of every output line
fn listed_ids(output: &[u8]) -> HashSet<String> {
    String::from_utf8_lossy(output)
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl DeviceHandler for StaticHandler {
    fn name(&self) -> &str {
        self.platform.manager_name()
    }

    async fn init(&self) -> Result<()> {
        info!(
            "{} handler serving {} device(s)",
            self.platform,
            self.devices.read().await.len()
        );
        self.refresh_devices(true).await
    }

    async fn start_device(&self, device_id: &str) -> Result<()> {
        let device = self.find(device_id).await?;
        if let Some(template) = &self.commands.start_device {
            command::run(template, &CommandVars::new().set("device", device_id)).await?;
        }
        device.core().set_state(DeviceState::Booted).await;
        Ok(())
    }

    async fn stop_device(&self, device_id: &str) -> Result<()> {
        let device = self.find(device_id).await?;
        if let Some(template) = &self.commands.stop_device {
            command::run(template, &CommandVars::new().set("device", device_id)).await?;
            device.core().set_state(DeviceState::Shutdown).await;
        }
        Ok(())
    }

    async fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices
            .read()
            .await
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn Device>)
            .collect()
    }

    async fn refresh_devices(&self, force: bool) -> Result<()> {
        if !self.due_for_listing(force).await {
            return Ok(());
        }

        let devices = self.devices.read().await.clone();
        let Some(template) = &self.commands.list else {
            for device in &devices {
                if device.core().state().await == DeviceState::Unknown {
                    device.core().set_state(DeviceState::Booted).await;
                }
            }
            return Ok(());
        };

        let listed = match command::run(template, &CommandVars::new()).await {
            Ok(output) => listed_ids(&output),
            Err(e) => {
                warn!("Listing {} devices failed: {}", self.platform, e);
                return Err(e);
            }
        };

        for device in &devices {
            let state = if listed.contains(device.core().id()) {
                DeviceState::Booted
            } else {
                DeviceState::Shutdown
            };
            device.core().set_state(state).await;
        }
        debug!("{}: {} device(s) listed", self.platform, listed.len());
        Ok(())
    }
}
