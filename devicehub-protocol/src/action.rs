//! Action envelopes exchanged with the on-device agent.
//!
//! Requests go master → device, responses go device → master. Both carry an
//! integer action-type tag and a payload union where only the fields relevant
//! to that action are present.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::encoding::{base64_bytes, base64_opt};

/// Integer tag outside the known range of an enum
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: i32,
}

/// Declares a fieldless enum encoded on the wire as its `i32` discriminant
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident as $label:literal {
            $($variant:ident = $value:literal => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "i32", try_from = "i32")]
        pub enum $name {
            $($variant = $value,)+
        }

        impl $name {
            /// Stable name used in logs
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl From<$name> for i32 {
            fn from(v: $name) -> i32 {
                v as i32
            }
        }

        impl TryFrom<i32> for $name {
            type Error = UnknownTag;

            fn try_from(value: i32) -> Result<Self, UnknownTag> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err(UnknownTag { kind: $label, value }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

wire_enum! {
    /// Every operation the device agent understands
    pub enum ActionType as "action type" {
        Custom = 0 => "Custom",
        GetSceneGraph = 1 => "GetSceneGraph",
        ElementIsDisplayed = 2 => "ElementIsDisplayed",
        ElementSetValue = 3 => "ElementSetValue",
        ElementGetValue = 4 => "ElementGetValue",
        Move = 5 => "Move",
        TouchDown = 6 => "TouchDown",
        TouchMove = 7 => "TouchMove",
        TouchUp = 8 => "TouchUp",
        DragAndDrop = 9 => "DragAndDrop",
        LongTouch = 10 => "LongTouch",
        ElementTouch = 11 => "ElementTouch",
        GetScreenshot = 12 => "GetScreenshot",
        GetTests = 13 => "GetTests",
        ExecuteTest = 14 => "ExecuteTest",
        ExecutionResult = 15 => "ExecutionResult",
        Log = 16 => "Log",
        UnityReset = 17 => "UnityReset",
        Performance = 18 => "Performance",
        NativeScript = 19 => "NativeScript",
        ExecuteMethodStart = 20 => "ExecuteMethodStart",
        ExecuteMethodFinished = 21 => "ExecuteMethodFinished",
    }
}

wire_enum! {
    pub enum LogType as "log type" {
        DeviceLog = 0 => "device",
        StepLog = 1 => "step",
        StatusLog = 2 => "status",
        CheckpointLog = 3 => "checkpoint",
        PerformanceLog = 4 => "performance",
    }
}

wire_enum! {
    pub enum LogLevel as "log level" {
        Debug = 0 => "debug",
        Info = 1 => "info",
        Warning = 2 => "warning",
        Error = 3 => "error",
        Exception = 4 => "exception",
    }
}

wire_enum! {
    /// Encoding of the scene graph attached to a screenshot
    pub enum ContentType as "content type" {
        Flatbuffer = 0 => "flatbuffer",
        Json = 1 => "json",
        Xml = 2 => "xml",
    }
}

wire_enum! {
    pub enum AppType as "app type" {
        Cocos = 0 => "cocos",
        Unity = 1 => "unity",
    }
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Json
    }
}

impl Default for AppType {
    fn default() -> Self {
        AppType::Unity
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttr {
    pub id: String,
    pub attr: String,
    pub val: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAttr {
    pub id: String,
    pub attr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveOffset {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveElement {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Touch {
    #[serde(default)]
    pub id: String,
    pub xoffset: i64,
    pub yoffset: i64,
}

/// A test method exposed by the app under test
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    #[serde(default)]
    pub assembly: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub parameter: HashMap<String, String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tests {
    #[serde(default)]
    pub tests: Vec<Test>,
}

/// Handshake parameters sent by the agent as its first message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    #[serde(rename = "customerId", default)]
    pub customer_id: String,
    #[serde(rename = "appID", default)]
    pub app_id: String,
    #[serde(rename = "appType", default)]
    pub app_type: AppType,
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "appVersion", default)]
    pub app_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    #[serde(with = "base64_bytes", default)]
    pub sceengraph: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub screenshot: Vec<u8>,
    #[serde(rename = "contentType", default)]
    pub content_type: ContentType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogData {
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub level: LogLevel,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDetails {
    #[serde(default)]
    pub test: String,
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceData {
    #[serde(default)]
    pub checkpoint: String,
    #[serde(rename = "CPU", default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(rename = "FPS", default)]
    pub fps: f64,
    #[serde(rename = "VertexCount", default)]
    pub vertex_count: f64,
    #[serde(rename = "Triangles", default)]
    pub triangles: f64,
}

/// Request payload union
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(with = "base64_opt", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_attr: Option<SetAttr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_attr: Option<GetAttr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_offset: Option<MoveOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touch: Option<Touch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_element: Option<MoveElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<Test>,
}

/// Envelope sent to the device agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "actionID", default)]
    pub action_id: String,
    #[serde(rename = "actionType")]
    pub action_type: ActionType,
    #[serde(default)]
    pub payload: RequestData,
}

impl Request {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_id: String::new(),
            action_type,
            payload: RequestData::default(),
        }
    }

    pub fn with_payload(action_type: ActionType, payload: RequestData) -> Self {
        Self {
            action_id: String::new(),
            action_type,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Response payload union
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(with = "base64_opt", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Screenshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<Connect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Tests>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_data: Option<LogData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_details: Option<TestDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_data: Option<PerformanceData>,
}

/// Envelope received from the device agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "actionID", default)]
    pub action_id: String,
    #[serde(rename = "actionType")]
    pub action_type: ActionType,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub payload: ResponseData,
}

impl Response {
    pub fn new(action_type: ActionType, success: bool) -> Self {
        Self {
            action_id: String::new(),
            action_type,
            success,
            payload: ResponseData::default(),
        }
    }

    /// Handshake envelope an agent sends right after connecting
    pub fn connect(connect: Connect) -> Self {
        let mut response = Self::new(ActionType::Custom, true);
        response.payload.connect = Some(connect);
        response
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
