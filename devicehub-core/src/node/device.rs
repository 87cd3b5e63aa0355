use async_trait::async_trait;
use devicehub_protocol::rpc::{
    AppRequest, BoolResponse, DataRequest, DeviceRequest, DurationResponse, ExecuteRequest,
    FeatureRequest, RecordingRequest, ScreenshotResponse, StartAppRequest,
};
use devicehub_protocol::{AppParameter, RpcMethod};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::manager::NodeManager;
use crate::device::{Device, DeviceCore, DeviceDetails, ScreenshotData};
use crate::error::{HubError, Result};

/// Used when a node cannot report a device's connection timeout
const FALLBACK_CONNECTION_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Master-side stand-in for a device attached to a node
///
/// Every operation is forwarded over the node's RPC channel. Responses from
/// the device's agent come back through the node's action callback and are
/// dispatched into this proxy's core.
pub struct NodeDevice {
    core: DeviceCore,
    node_id: String,
    /// Handler that owns the device on the node
    remote_manager: String,
    nodes: Arc<NodeManager>,
}

impl NodeDevice {
    pub fn new(
        nodes: Arc<NodeManager>,
        node_id: impl Into<String>,
        remote_manager: impl Into<String>,
        device_id: impl Into<String>,
        details: DeviceDetails,
    ) -> Self {
        Self {
            core: DeviceCore::new(device_id, details),
            node_id: node_id.into(),
            remote_manager: remote_manager.into(),
            nodes,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn remote_manager(&self) -> &str {
        &self.remote_manager
    }

    fn request(&self) -> DeviceRequest {
        DeviceRequest {
            device_id: self.core.id().to_string(),
        }
    }

    async fn call<P, R>(&self, method: RpcMethod, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        self.nodes
            .call(&self.node_id, method, params)
            .await
            .map_err(|e| match e {
                HubError::Rpc { code, message } => {
                    HubError::from_rpc(code, message, Some(self.core.id()))
                }
                other => other,
            })
    }

    async fn call_unit<P>(&self, method: RpcMethod, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized + Sync,
    {
        let _: Value = self.call(method, params).await?;
        Ok(())
    }
}

#[async_trait]
impl Device for NodeDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn manager(&self) -> &str {
        super::NODE_MANAGER
    }

    async fn is_app_installed(&self, app: &AppParameter) -> Result<bool> {
        let response: BoolResponse = self
            .call(
                RpcMethod::IsAppInstalled,
                &AppRequest {
                    device_id: self.core.id().to_string(),
                    app: app.clone(),
                },
            )
            .await?;
        Ok(response.value)
    }

    async fn install_app(&self, app: &AppParameter) -> Result<()> {
        self.call_unit(
            RpcMethod::InstallApp,
            &AppRequest {
                device_id: self.core.id().to_string(),
                app: app.clone(),
            },
        )
        .await
    }

    async fn uninstall_app(&self, app: &AppParameter) -> Result<()> {
        self.call_unit(
            RpcMethod::UninstallApp,
            &AppRequest {
                device_id: self.core.id().to_string(),
                app: app.clone(),
            },
        )
        .await
    }

    async fn start_app(&self, app: &AppParameter, session_id: &str, node_url: &str) -> Result<()> {
        self.call_unit(
            RpcMethod::StartApp,
            &StartAppRequest {
                device_id: self.core.id().to_string(),
                app: app.clone(),
                session_id: session_id.to_string(),
                node_url: node_url.to_string(),
            },
        )
        .await
    }

    async fn stop_app(&self, app: &AppParameter) -> Result<()> {
        self.call_unit(
            RpcMethod::StopApp,
            &AppRequest {
                device_id: self.core.id().to_string(),
                app: app.clone(),
            },
        )
        .await
    }

    async fn start_recording(&self, path: &str) -> Result<()> {
        self.call_unit(
            RpcMethod::StartRecording,
            &RecordingRequest {
                device_id: self.core.id().to_string(),
                path: path.to_string(),
            },
        )
        .await
    }

    async fn stop_recording(&self) -> Result<()> {
        self.call_unit(RpcMethod::StopRecording, &self.request()).await
    }

    async fn get_screenshot(&self) -> Result<ScreenshotData> {
        let response: ScreenshotResponse =
            self.call(RpcMethod::GetScreenshot, &self.request()).await?;
        Ok(ScreenshotData {
            data: response.data,
            width: response.width,
            height: response.height,
        })
    }

    async fn has_feature(&self, feature: &str) -> bool {
        let result: Result<BoolResponse> = self
            .call(
                RpcMethod::HasFeature,
                &FeatureRequest {
                    device_id: self.core.id().to_string(),
                    feature: feature.to_string(),
                },
            )
            .await;
        match result {
            Ok(response) => response.value,
            Err(e) => {
                warn!("HasFeature on {} failed: {}", self.core.id(), e);
                false
            }
        }
    }

    async fn execute(&self, data: &str) -> Result<()> {
        self.call_unit(
            RpcMethod::Execute,
            &ExecuteRequest {
                device_id: self.core.id().to_string(),
                data: data.to_string(),
            },
        )
        .await
    }

    async fn run_native_script(&self, script: &[u8]) -> Result<()> {
        self.call_unit(
            RpcMethod::RunNativeScript,
            &DataRequest {
                device_id: self.core.id().to_string(),
                data: script.to_vec(),
            },
        )
        .await
    }

    async fn connection_timeout(&self) -> Duration {
        let result: Result<DurationResponse> =
            self.call(RpcMethod::ConnectionTimeout, &self.request()).await;
        match result {
            Ok(response) => Duration::from_millis(response.millis),
            Err(e) => {
                warn!("ConnectionTimeout on {} failed: {}", self.core.id(), e);
                FALLBACK_CONNECTION_TIMEOUT
            }
        }
    }

    async fn is_app_connected(&self) -> bool {
        let result: Result<BoolResponse> =
            self.call(RpcMethod::IsConnected, &self.request()).await;
        let connected = result.map(|r| r.value).unwrap_or(false);
        self.core.set_remote_connected(connected).await;
        connected
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.call_unit(
            RpcMethod::SendAction,
            &DataRequest {
                device_id: self.core.id().to_string(),
                data,
            },
        )
        .await
    }
}
