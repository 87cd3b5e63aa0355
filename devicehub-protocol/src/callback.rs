//! Bodies of the node → master HTTP callbacks (`/node/log`, `/node/action`).

use serde::{Deserialize, Serialize};

use crate::action::Response;

/// Kind of a forwarded log entry (integer on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum NodeLogType {
    Performance = 0,
    Data = 1,
    Log = 2,
    Error = 3,
}

impl From<NodeLogType> for i32 {
    fn from(v: NodeLogType) -> i32 {
        v as i32
    }
}

impl TryFrom<i32> for NodeLogType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, String> {
        match value {
            0 => Ok(NodeLogType::Performance),
            1 => Ok(NodeLogType::Data),
            2 => Ok(NodeLogType::Log),
            3 => Ok(NodeLogType::Error),
            _ => Err(format!("unknown log type: {}", value)),
        }
    }
}

/// `POST /node/log`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLogRequest {
    pub node: String,
    #[serde(alias = "deviceId")]
    pub device_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "type")]
    pub log_type: NodeLogType,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub checkpoint: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub fps: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default)]
    pub vertex_count: f64,
    #[serde(default)]
    pub triangles: f64,
    #[serde(default)]
    pub other: String,
}

impl NodeLogRequest {
    pub fn new(node: &str, device_id: &str, log_type: NodeLogType, source: &str) -> Self {
        Self {
            node: node.to_string(),
            device_id: device_id.to_string(),
            source: source.to_string(),
            log_type,
            message: String::new(),
            checkpoint: String::new(),
            cpu: 0.0,
            fps: 0.0,
            mem: 0.0,
            vertex_count: 0.0,
            triangles: 0.0,
            other: String::new(),
        }
    }
}

/// `POST /node/action`; a `null` response means the device disconnected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeActionRequest {
    pub node: String,
    #[serde(alias = "deviceId")]
    pub device_id: String,
    #[serde(default)]
    pub response: Option<Response>,
}
