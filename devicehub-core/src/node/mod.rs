//! Master–node relay.
//!
//! The master keeps a [`NodeManager`] of registered nodes and exposes their
//! devices through a [`NodeHandler`]. A node answers the master's RPC calls
//! with an [`RpcNodeService`] and pushes agent traffic back through
//! [`MasterCallbacks`].

pub mod bundle;
pub mod client;
pub mod device;
pub mod handler;
pub mod manager;
pub mod reconnect;
pub mod remote;
pub mod service;

/// Manager name under which node devices appear on the master
pub const NODE_MANAGER: &str = "node";

pub use bundle::AppBundleStore;
pub use client::{invoke, NodeClient, RpcClient};
pub use device::NodeDevice;
pub use handler::NodeHandler;
pub use manager::{Node, NodeManager, NodeStatus};
pub use reconnect::ReconnectHandler;
pub use remote::{MasterCallbacks, RemoteActionHandler, RemoteLogWriter};
pub use service::RpcNodeService;
