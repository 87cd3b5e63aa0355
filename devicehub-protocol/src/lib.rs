pub mod action;
pub mod callback;
pub mod encoding;
pub mod rpc;
pub mod types;
pub mod wire;

pub use action::{ActionType, Request, Response};
pub use rpc::{RpcFrame, RpcMethod, RpcRequest, RpcResponse};
pub use types::{AppParameter, ConnectionState, DeviceInfo, DeviceState};
pub use wire::{read_frame, recv_message, send_message, write_frame, WireError};
