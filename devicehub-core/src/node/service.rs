use devicehub_protocol::rpc::{
    error_code, AppRequest, BoolResponse, BundleRequest, DataRequest, DeviceRequest,
    DevicesResponse, DurationResponse, ExecuteRequest, FeatureRequest, RecordingRequest,
    ScreenshotResponse, StartAppRequest, UploadAppProgressRequest, UploadAppRequest,
};
use devicehub_protocol::{RpcFrame, RpcMethod, RpcRequest, RpcResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::bundle::AppBundleStore;
use super::reconnect::ReconnectHandler;
use crate::device::Device;
use crate::error::{HubError, Result};
use crate::manager::DeviceManager;

/// Serves the master's RPC calls against the node's local devices
pub struct RpcNodeService {
    devices: Arc<DeviceManager>,
    bundles: Arc<AppBundleStore>,
    reconnect: Option<Arc<ReconnectHandler>>,
    /// Address agents launched by this node connect back to
    node_url: String,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| HubError::Rpc {
        code: error_code::INVALID_PARAMS,
        message: e.to_string(),
    })
}

fn reply<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

impl RpcNodeService {
    pub fn new(
        devices: Arc<DeviceManager>,
        bundles: Arc<AppBundleStore>,
        node_url: impl Into<String>,
    ) -> Self {
        Self {
            devices,
            bundles,
            reconnect: None,
            node_url: node_url.into(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: Arc<ReconnectHandler>) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Answer requests from `incoming` on `outgoing` until either side closes
    ///
    /// Each request runs on its own task, so a slow install does not hold
    /// up pings.
    pub async fn serve(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<Vec<u8>>,
        outgoing: mpsc::Sender<Vec<u8>>,
    ) {
        while let Some(bytes) = incoming.recv().await {
            let request = match RpcFrame::decode(&bytes) {
                Ok(RpcFrame::Request(request)) => request,
                Ok(RpcFrame::Response(response)) => {
                    debug!("Ignoring RPC response {} sent to node", response.id);
                    continue;
                }
                Err(e) => {
                    let Some(id) = request_id(&bytes) else {
                        warn!("Dropping undecodable RPC frame: {}", e);
                        continue;
                    };
                    let response = RpcResponse::error(id, error_code::UNKNOWN_METHOD, e.to_string());
                    send_response(&outgoing, response).await;
                    continue;
                }
            };

            let service = Arc::clone(&self);
            let outgoing = outgoing.clone();
            tokio::spawn(async move {
                let response = service.handle(request).await;
                send_response(&outgoing, response).await;
            });
        }
        debug!("RPC service stopped");
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let method = request.method;
        match self.dispatch(method, request.params).await {
            Ok(result) => RpcResponse::ok(request.id, result),
            Err(e) => {
                if method != RpcMethod::Ping {
                    warn!("{} failed: {}", method.as_str(), e);
                }
                RpcResponse::error(request.id, e.rpc_code(), e.rpc_message())
            }
        }
    }

    async fn device(&self, device_id: &str) -> Result<Arc<dyn Device>> {
        Ok(self.devices.get_device(device_id).await?.0)
    }

    async fn dispatch(&self, method: RpcMethod, params: Value) -> Result<Value> {
        match method {
            RpcMethod::Ping => {
                if let Some(reconnect) = &self.reconnect {
                    reconnect.ping_received().await;
                }
                Ok(Value::Null)
            }
            RpcMethod::GetDevices => {
                self.devices.refresh(false).await;
                reply(DevicesResponse {
                    managers: self.devices.devices_by_manager().await,
                })
            }
            RpcMethod::StartDevice => {
                let req: DeviceRequest = parse(params)?;
                self.devices.start(&req.device_id).await?;
                Ok(Value::Null)
            }
            RpcMethod::StopDevice => {
                let req: DeviceRequest = parse(params)?;
                self.devices.stop(&req.device_id).await?;
                Ok(Value::Null)
            }
            RpcMethod::IsAppInstalled => {
                let req: AppRequest = parse(params)?;
                let app = self.bundles.resolve(req.app);
                let value = self.device(&req.device_id).await?.is_app_installed(&app).await?;
                reply(BoolResponse { value })
            }
            RpcMethod::InstallApp => {
                let req: AppRequest = parse(params)?;
                let app = self.bundles.resolve(req.app);
                self.device(&req.device_id).await?.install_app(&app).await?;
                Ok(Value::Null)
            }
            RpcMethod::UninstallApp => {
                let req: AppRequest = parse(params)?;
                self.device(&req.device_id).await?.uninstall_app(&req.app).await?;
                Ok(Value::Null)
            }
            RpcMethod::StartApp => {
                let req: StartAppRequest = parse(params)?;
                let device = self.device(&req.device_id).await?;
                let app = self.bundles.resolve(req.app);
                // the agent dials this node, not the master
                self.devices.bind_session(&req.session_id, &req.device_id).await;
                device.start_app(&app, &req.session_id, &self.node_url).await?;
                Ok(Value::Null)
            }
            RpcMethod::StopApp => {
                let req: AppRequest = parse(params)?;
                self.device(&req.device_id).await?.stop_app(&req.app).await?;
                Ok(Value::Null)
            }
            RpcMethod::IsConnected => {
                let req: DeviceRequest = parse(params)?;
                let value = self.device(&req.device_id).await?.is_app_connected().await;
                reply(BoolResponse { value })
            }
            RpcMethod::StartRecording => {
                let req: RecordingRequest = parse(params)?;
                self.device(&req.device_id).await?.start_recording(&req.path).await?;
                Ok(Value::Null)
            }
            RpcMethod::StopRecording => {
                let req: DeviceRequest = parse(params)?;
                self.device(&req.device_id).await?.stop_recording().await?;
                Ok(Value::Null)
            }
            RpcMethod::GetScreenshot => {
                let req: DeviceRequest = parse(params)?;
                let shot = self.device(&req.device_id).await?.get_screenshot().await?;
                reply(ScreenshotResponse {
                    data: shot.data,
                    width: shot.width,
                    height: shot.height,
                })
            }
            RpcMethod::HasFeature => {
                let req: FeatureRequest = parse(params)?;
                let value = self.device(&req.device_id).await?.has_feature(&req.feature).await;
                reply(BoolResponse { value })
            }
            RpcMethod::Execute => {
                let req: ExecuteRequest = parse(params)?;
                self.device(&req.device_id).await?.execute(&req.data).await?;
                Ok(Value::Null)
            }
            RpcMethod::ConnectionTimeout => {
                let req: DeviceRequest = parse(params)?;
                let timeout = self.device(&req.device_id).await?.connection_timeout().await;
                reply(DurationResponse {
                    millis: timeout.as_millis() as u64,
                })
            }
            RpcMethod::RunNativeScript => {
                let req: DataRequest = parse(params)?;
                self.device(&req.device_id).await?.run_native_script(&req.data).await?;
                Ok(Value::Null)
            }
            RpcMethod::SendAction => {
                let req: DataRequest = parse(params)?;
                self.device(&req.device_id).await?.send(req.data).await?;
                Ok(Value::Null)
            }
            RpcMethod::UploadApp => {
                let req: UploadAppRequest = parse(params)?;
                self.bundles.start_upload(req).await?;
                Ok(Value::Null)
            }
            RpcMethod::UploadAppProgress => {
                let req: UploadAppProgressRequest = parse(params)?;
                reply(self.bundles.progress(req.app_id).await?)
            }
            RpcMethod::IsAppUploaded => {
                let req: BundleRequest = parse(params)?;
                reply(BoolResponse {
                    value: self.bundles.contains(&req.hash),
                })
            }
        }
    }
}

/// Best-effort id of a request whose method or params failed to decode
fn request_id(bytes: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value.get("id")?.as_u64()
}

async fn send_response(outgoing: &mpsc::Sender<Vec<u8>>, response: RpcResponse) {
    match RpcFrame::Response(response).encode() {
        Ok(frame) => {
            if outgoing.send(frame).await.is_err() {
                debug!("RPC transport closed before response was sent");
            }
        }
        Err(e) => warn!("Failed to encode RPC response: {}", e),
    }
}
