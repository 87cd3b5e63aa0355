//! Master → node RPC tunnel.
//!
//! After a node registers, each websocket message carries one [`RpcFrame`].
//! The master sends requests, the node answers with responses bearing the
//! same `id`. Every response carries `error_code`/`error_message`; a
//! non-zero code means the call failed on the node.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::encoding::base64_bytes;
use crate::types::{AppParameter, DeviceInfo};

/// Error codes carried in [`RpcResponse::error_code`]
pub mod error_code {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const DEVICE_NOT_FOUND: i32 = 2;
    pub const UNKNOWN_METHOD: i32 = 3;
    pub const INVALID_PARAMS: i32 = 4;
    pub const UPLOAD_NOT_FOUND: i32 = 5;
    pub const DEVICE_NOT_CONNECTED: i32 = 6;
    pub const DEVICE_DISCONNECTED: i32 = 7;
    pub const ACTION_TIMEOUT: i32 = 8;
    pub const CONNECTION_TIMEOUT: i32 = 9;
    pub const DEVICE_ALREADY_LOCKED: i32 = 10;
    pub const DEVICE_NOT_LOCKED: i32 = 11;
    pub const MANAGER_NOT_FOUND: i32 = 12;
    pub const NODE_NOT_FOUND: i32 = 13;
    pub const NODE_NOT_CONNECTED: i32 = 14;
    pub const UNKNOWN_SESSION: i32 = 15;
    pub const SESSION_EXISTS: i32 = 16;
    pub const NO_DEVICE_AVAILABLE: i32 = 17;
    pub const WAIT_TIMEOUT: i32 = 18;
    pub const CANCELED: i32 = 19;
    pub const UNEXPECTED_RESPONSE: i32 = 20;
    pub const UNSUPPORTED: i32 = 21;
    pub const COMMAND_FAILED: i32 = 22;
    pub const SERIALIZATION: i32 = 23;
    pub const TRANSPORT: i32 = 24;
    pub const IO: i32 = 25;
}

/// Fixed method table served by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcMethod {
    #[serde(rename = "RPCNode.Ping")]
    Ping,
    #[serde(rename = "RPCNode.GetDevices")]
    GetDevices,
    #[serde(rename = "RPCNode.StartDevice")]
    StartDevice,
    #[serde(rename = "RPCNode.StopDevice")]
    StopDevice,
    #[serde(rename = "RPCNode.IsAppInstalled")]
    IsAppInstalled,
    #[serde(rename = "RPCNode.InstallApp")]
    InstallApp,
    #[serde(rename = "RPCNode.UninstallApp")]
    UninstallApp,
    #[serde(rename = "RPCNode.StartApp")]
    StartApp,
    #[serde(rename = "RPCNode.StopApp")]
    StopApp,
    #[serde(rename = "RPCNode.IsConnected")]
    IsConnected,
    #[serde(rename = "RPCNode.StartRecording")]
    StartRecording,
    #[serde(rename = "RPCNode.StopRecording")]
    StopRecording,
    #[serde(rename = "RPCNode.GetScreenshot")]
    GetScreenshot,
    #[serde(rename = "RPCNode.HasFeature")]
    HasFeature,
    #[serde(rename = "RPCNode.Execute")]
    Execute,
    #[serde(rename = "RPCNode.ConnectionTimeout")]
    ConnectionTimeout,
    #[serde(rename = "RPCNode.RunNativeScript")]
    RunNativeScript,
    #[serde(rename = "RPCNode.SendAction")]
    SendAction,
    #[serde(rename = "RPCNode.UploadApp")]
    UploadApp,
    #[serde(rename = "RPCNode.UploadAppProgress")]
    UploadAppProgress,
    #[serde(rename = "RPCNode.IsAppUploaded")]
    IsAppUploaded,
}

impl RpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::Ping => "RPCNode.Ping",
            RpcMethod::GetDevices => "RPCNode.GetDevices",
            RpcMethod::StartDevice => "RPCNode.StartDevice",
            RpcMethod::StopDevice => "RPCNode.StopDevice",
            RpcMethod::IsAppInstalled => "RPCNode.IsAppInstalled",
            RpcMethod::InstallApp => "RPCNode.InstallApp",
            RpcMethod::UninstallApp => "RPCNode.UninstallApp",
            RpcMethod::StartApp => "RPCNode.StartApp",
            RpcMethod::StopApp => "RPCNode.StopApp",
            RpcMethod::IsConnected => "RPCNode.IsConnected",
            RpcMethod::StartRecording => "RPCNode.StartRecording",
            RpcMethod::StopRecording => "RPCNode.StopRecording",
            RpcMethod::GetScreenshot => "RPCNode.GetScreenshot",
            RpcMethod::HasFeature => "RPCNode.HasFeature",
            RpcMethod::Execute => "RPCNode.Execute",
            RpcMethod::ConnectionTimeout => "RPCNode.ConnectionTimeout",
            RpcMethod::RunNativeScript => "RPCNode.RunNativeScript",
            RpcMethod::SendAction => "RPCNode.SendAction",
            RpcMethod::UploadApp => "RPCNode.UploadApp",
            RpcMethod::UploadAppProgress => "RPCNode.UploadAppProgress",
            RpcMethod::IsAppUploaded => "RPCNode.IsAppUploaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: RpcMethod,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: String,
}

impl RpcResponse {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result,
            error_code: error_code::OK,
            error_message: String::new(),
        }
    }

    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: serde_json::Value::Null,
            error_code: code,
            error_message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != error_code::OK
    }
}

/// One message on the RPC tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcFrame {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl RpcFrame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// First message a node sends after the websocket upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub identifier: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub operation_system: String,
    #[serde(default)]
    pub environment_variables: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub managers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRequest {
    pub device_id: String,
    pub app: AppParameter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAppRequest {
    pub device_id: String,
    pub app: AppParameter,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub node_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRequest {
    pub device_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRequest {
    pub device_id: String,
    pub feature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub device_id: String,
    pub data: String,
}

/// Raw bytes for a device (native scripts, encoded actions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub device_id: String,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAppRequest {
    pub app_id: u32,
    pub name: String,
    pub hash: String,
    pub size: u64,
    /// Where the node downloads the binary from
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAppProgressRequest {
    pub app_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAppProgressResponse {
    pub app_id: u32,
    pub data_received: u64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRequest {
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolResponse {
    pub value: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesResponse {
    /// Devices grouped by manager name
    pub managers: HashMap<String, Vec<DeviceInfo>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotResponse {
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationResponse {
    pub millis: u64,
}
