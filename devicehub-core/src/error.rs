//! Error types for devicehub operations
//!
//! Device, node and session failures share one taxonomy. Each variant has
//! its own code in [`error_code`]; a node reports a failed call as that code
//! plus [`HubError::rpc_message`], and the master rebuilds the same variant
//! with [`HubError::from_rpc`]. Codes without a variant (unknown method,
//! invalid params, missing upload, generic failure) stay [`HubError::Rpc`].

use devicehub_protocol::rpc::error_code;
use devicehub_protocol::WireError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("manager {0} not found")]
    ManagerNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node not connected: {0}")]
    NodeNotConnected(String),

    /// No live agent connection; nothing was written
    #[error("device not connected")]
    DeviceNotConnected,

    /// The agent connection dropped while a call was waiting on it
    #[error("device disconnected")]
    DeviceDisconnected,

    #[error("action {0} timed out")]
    ActionTimeout(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("can't lock device, device is already locked")]
    DeviceAlreadyLocked,

    #[error("can't unlock device, device was not locked")]
    DeviceNotLocked,

    #[error("session {0} not found")]
    UnknownSession(String),

    #[error("session {0} already holds a device")]
    SessionExists(String),

    #[error("no device available matching the requested properties")]
    NoDeviceAvailable,

    #[error("group timed out")]
    WaitTimeout,

    #[error("wait canceled")]
    Canceled,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("{0} is not supported by this device")]
    Unsupported(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Code reported to the master when this error ends an RPC call on a node
    pub fn rpc_code(&self) -> i32 {
        match self {
            HubError::DeviceNotFound(_) => error_code::DEVICE_NOT_FOUND,
            HubError::ManagerNotFound(_) => error_code::MANAGER_NOT_FOUND,
            HubError::NodeNotFound(_) => error_code::NODE_NOT_FOUND,
            HubError::NodeNotConnected(_) => error_code::NODE_NOT_CONNECTED,
            HubError::DeviceNotConnected => error_code::DEVICE_NOT_CONNECTED,
            HubError::DeviceDisconnected => error_code::DEVICE_DISCONNECTED,
            HubError::ActionTimeout(_) => error_code::ACTION_TIMEOUT,
            HubError::ConnectionTimeout => error_code::CONNECTION_TIMEOUT,
            HubError::DeviceAlreadyLocked => error_code::DEVICE_ALREADY_LOCKED,
            HubError::DeviceNotLocked => error_code::DEVICE_NOT_LOCKED,
            HubError::UnknownSession(_) => error_code::UNKNOWN_SESSION,
            HubError::SessionExists(_) => error_code::SESSION_EXISTS,
            HubError::NoDeviceAvailable => error_code::NO_DEVICE_AVAILABLE,
            HubError::WaitTimeout => error_code::WAIT_TIMEOUT,
            HubError::Canceled => error_code::CANCELED,
            HubError::UnexpectedResponse(_) => error_code::UNEXPECTED_RESPONSE,
            HubError::Unsupported(_) => error_code::UNSUPPORTED,
            HubError::Command(_) => error_code::COMMAND_FAILED,
            HubError::Rpc { code, .. } => *code,
            HubError::Serialization(_) => error_code::SERIALIZATION,
            HubError::Transport(_) => error_code::TRANSPORT,
            HubError::Io(_) => error_code::IO,
        }
    }

    /// Message sent alongside [`rpc_code`](Self::rpc_code)
    ///
    /// Variants with a payload send the payload alone so the receiving side
    /// can rebuild them; the rest send their display text.
    pub fn rpc_message(&self) -> String {
        match self {
            HubError::DeviceNotFound(s)
            | HubError::ManagerNotFound(s)
            | HubError::NodeNotFound(s)
            | HubError::NodeNotConnected(s)
            | HubError::ActionTimeout(s)
            | HubError::UnknownSession(s)
            | HubError::SessionExists(s)
            | HubError::UnexpectedResponse(s)
            | HubError::Unsupported(s)
            | HubError::Command(s)
            | HubError::Transport(s) => s.clone(),
            HubError::Rpc { message, .. } => message.clone(),
            HubError::Serialization(e) => e.to_string(),
            HubError::Io(e) => e.to_string(),
            other => other.to_string(),
        }
    }

    /// Rebuild a typed error from an RPC error response
    ///
    /// `device_id` names the device the call was about and takes precedence
    /// over the message for `DeviceNotFound`.
    pub fn from_rpc(code: i32, message: String, device_id: Option<&str>) -> Self {
        match code {
            error_code::DEVICE_NOT_FOUND => {
                HubError::DeviceNotFound(device_id.map(str::to_string).unwrap_or(message))
            }
            error_code::MANAGER_NOT_FOUND => HubError::ManagerNotFound(message),
            error_code::NODE_NOT_FOUND => HubError::NodeNotFound(message),
            error_code::NODE_NOT_CONNECTED => HubError::NodeNotConnected(message),
            error_code::DEVICE_NOT_CONNECTED => HubError::DeviceNotConnected,
            error_code::DEVICE_DISCONNECTED => HubError::DeviceDisconnected,
            error_code::ACTION_TIMEOUT => HubError::ActionTimeout(message),
            error_code::CONNECTION_TIMEOUT => HubError::ConnectionTimeout,
            error_code::DEVICE_ALREADY_LOCKED => HubError::DeviceAlreadyLocked,
            error_code::DEVICE_NOT_LOCKED => HubError::DeviceNotLocked,
            error_code::UNKNOWN_SESSION => HubError::UnknownSession(message),
            error_code::SESSION_EXISTS => HubError::SessionExists(message),
            error_code::NO_DEVICE_AVAILABLE => HubError::NoDeviceAvailable,
            error_code::WAIT_TIMEOUT => HubError::WaitTimeout,
            error_code::CANCELED => HubError::Canceled,
            error_code::UNEXPECTED_RESPONSE => HubError::UnexpectedResponse(message),
            error_code::UNSUPPORTED => HubError::Unsupported(message),
            error_code::COMMAND_FAILED => HubError::Command(message),
            error_code::SERIALIZATION => {
                HubError::Serialization(<serde_json::Error as serde::de::Error>::custom(message))
            }
            error_code::TRANSPORT => HubError::Transport(message),
            error_code::IO => HubError::Io(std::io::Error::other(message)),
            _ => HubError::Rpc { code, message },
        }
    }
}

impl From<WireError> for HubError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Closed => HubError::DeviceDisconnected,
            WireError::Json(e) => HubError::Serialization(e),
            other => HubError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        HubError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HubError>;

/// Errors related to configuration file operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ValidationError(String),

    #[error("Could not determine home directory")]
    NoHomeDirectory,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relayed(err: &HubError) -> HubError {
        HubError::from_rpc(err.rpc_code(), err.rpc_message(), None)
    }

    #[test]
    fn test_every_variant_keeps_its_code_across_the_relay() {
        let errors = vec![
            HubError::DeviceNotFound("dev-1".to_string()),
            HubError::ManagerNotFound("ios_sim".to_string()),
            HubError::NodeNotFound("node-b".to_string()),
            HubError::NodeNotConnected("node-b".to_string()),
            HubError::DeviceNotConnected,
            HubError::DeviceDisconnected,
            HubError::ActionTimeout("GetScreenshot".to_string()),
            HubError::ConnectionTimeout,
            HubError::DeviceAlreadyLocked,
            HubError::DeviceNotLocked,
            HubError::UnknownSession("s-1".to_string()),
            HubError::SessionExists("s-1".to_string()),
            HubError::NoDeviceAvailable,
            HubError::WaitTimeout,
            HubError::Canceled,
            HubError::UnexpectedResponse("TestStart".to_string()),
            HubError::Unsupported("tap on web".to_string()),
            HubError::Command("adb exited with 1".to_string()),
            HubError::Transport("broken pipe".to_string()),
            HubError::Io(std::io::Error::other("disk full")),
        ];

        let mut codes = std::collections::HashSet::new();
        for err in &errors {
            let back = relayed(err);
            assert!(codes.insert(err.rpc_code()), "duplicate code for {:?}", err);
            assert_eq!(back.rpc_code(), err.rpc_code(), "{:?}", err);
            assert_eq!(back.to_string(), err.to_string(), "{:?}", err);
            assert!(!matches!(back, HubError::Rpc { .. }), "{:?}", err);
        }
    }

    #[test]
    fn test_payload_variants_send_only_the_payload() {
        let err = HubError::ActionTimeout("GetScreenshot".to_string());
        assert_eq!(err.rpc_message(), "GetScreenshot");
        match relayed(&err) {
            HubError::ActionTimeout(action) => assert_eq!(action, "GetScreenshot"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_device_id_wins_for_device_not_found() {
        match HubError::from_rpc(error_code::DEVICE_NOT_FOUND, "gone".to_string(), Some("dev-1")) {
            HubError::DeviceNotFound(id) => assert_eq!(id, "dev-1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_codes_without_variant_stay_rpc() {
        match HubError::from_rpc(error_code::INVALID_PARAMS, "bad".to_string(), None) {
            HubError::Rpc { code, message } => {
                assert_eq!(code, error_code::INVALID_PARAMS);
                assert_eq!(message, "bad");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
