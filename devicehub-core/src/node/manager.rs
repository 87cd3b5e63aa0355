use chrono::{DateTime, Utc};
use devicehub_protocol::rpc::{
    BoolResponse, BundleRequest, RegisterNodeRequest, UploadAppProgressRequest,
    UploadAppProgressResponse, UploadAppRequest,
};
use devicehub_protocol::RpcMethod;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{invoke, NodeClient};
use crate::config::Timeouts;
use crate::error::{HubError, Result};

/// Interval between two upload progress polls
pub const UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CONNECTED_CHANNEL_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Disconnected,
    Connected,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Disconnected => write!(f, "disconnected"),
            NodeStatus::Connected => write!(f, "connected"),
        }
    }
}

/// A registered node process
pub struct Node {
    pub identifier: String,
    pub hostname: String,
    pub address: String,
    pub operation_system: String,
    pub environment: String,
    pub port: u16,
    pub managers: Vec<String>,
    pub registered_at: DateTime<Utc>,
    last_seen: std::sync::Mutex<Instant>,
    status: RwLock<NodeStatus>,
    client: RwLock<Option<Arc<dyn NodeClient>>>,
}

impl Node {
    fn new(request: RegisterNodeRequest, address: String, client: Arc<dyn NodeClient>) -> Self {
        Self {
            identifier: request.identifier,
            hostname: request.hostname,
            address,
            operation_system: request.operation_system,
            environment: request.environment_variables,
            port: request.port,
            managers: request.managers,
            registered_at: Utc::now(),
            last_seen: std::sync::Mutex::new(Instant::now()),
            status: RwLock::new(NodeStatus::Connected),
            client: RwLock::new(Some(client)),
        }
    }

    pub async fn status(&self) -> NodeStatus {
        *self.status.read().await
    }

    pub fn last_seen(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    fn seen(&self) {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    /// RPC handle; gone for good once the node is disconnected
    pub async fn client(&self) -> Result<Arc<dyn NodeClient>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| HubError::NodeNotConnected(self.identifier.clone()))
    }

    async fn disconnect(&self, reason: &str) {
        *self.status.write().await = NodeStatus::Disconnected;
        let client = self.client.write().await.take();
        if let Some(client) = client {
            info!("Node {} disconnected: {}", self.identifier, reason);
            client.close().await;
        }
    }
}

/// Registry of connected nodes with periodic liveness probing
pub struct NodeManager {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    ping_interval: Duration,
    stale_after: Duration,
    connected_tx: broadcast::Sender<String>,
}

impl NodeManager {
    pub fn new(timeouts: &Timeouts) -> Self {
        let (connected_tx, _) = broadcast::channel(CONNECTED_CHANNEL_SIZE);
        Self {
            nodes: RwLock::new(HashMap::new()),
            ping_interval: timeouts.ping_interval(),
            stale_after: timeouts.ping_stale(),
            connected_tx,
        }
    }

    /// Add a node that just completed registration; a previous registration
    /// under the same identifier is disconnected first
    pub async fn register_node(
        &self,
        request: RegisterNodeRequest,
        address: impl Into<String>,
        client: Arc<dyn NodeClient>,
    ) -> Arc<Node> {
        let node = Arc::new(Node::new(request, address.into(), client));
        info!(
            "Node {} registered from {} with managers {:?}",
            node.identifier, node.address, node.managers
        );

        let previous = self
            .nodes
            .write()
            .await
            .insert(node.identifier.clone(), Arc::clone(&node));
        if let Some(previous) = previous {
            previous.disconnect("replaced by new registration").await;
        }

        let _ = self.connected_tx.send(node.identifier.clone());
        node
    }

    /// Identifiers of nodes as they register
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.connected_tx.subscribe()
    }

    pub async fn node(&self, identifier: &str) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .await
            .get(identifier)
            .cloned()
            .ok_or_else(|| HubError::NodeNotFound(identifier.to_string()))
    }

    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn get_status(&self, identifier: &str) -> Result<NodeStatus> {
        Ok(self.node(identifier).await?.status().await)
    }

    pub async fn get_managers(&self, identifier: &str) -> Result<Vec<String>> {
        Ok(self.node(identifier).await?.managers.clone())
    }

    /// Call `method` on a node; fails without I/O once the node is disconnected
    pub async fn call<P, R>(&self, identifier: &str, method: RpcMethod, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = self.node(identifier).await?.client().await?;
        invoke(client.as_ref(), method, params).await
    }

    /// Ping every connected node once
    pub async fn health_check(&self) {
        let nodes = self.nodes().await;
        let checks = nodes.iter().map(|node| self.check_node(node));
        futures::future::join_all(checks).await;
    }

    async fn check_node(&self, node: &Arc<Node>) {
        let Ok(client) = node.client().await else {
            return;
        };

        let ping = tokio::time::timeout(
            self.ping_interval,
            client.call(RpcMethod::Ping, Value::Null),
        )
        .await;

        match ping {
            Ok(Ok(_)) => node.seen(),
            Ok(Err(HubError::NodeNotConnected(_))) => {
                node.disconnect("transport closed").await;
                return;
            }
            Ok(Err(e)) => warn!("Ping to {} failed: {}", node.identifier, e),
            Err(_) => debug!("Ping to {} still pending", node.identifier),
        }

        if node.last_seen() > self.stale_after {
            node.disconnect(&format!("no ping answered for {:?}", node.last_seen()))
                .await;
        }
    }

    /// Probe nodes every ping interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.health_check().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Node health check stopped");
    }

    /// Make sure a node holds the app binary, uploading it when missing
    ///
    /// Polls the node's upload progress until it completes, fails or
    /// `deadline` passes.
    pub async fn upload_app(
        &self,
        identifier: &str,
        request: &UploadAppRequest,
        deadline: Duration,
    ) -> Result<()> {
        let uploaded: BoolResponse = self
            .call(
                identifier,
                RpcMethod::IsAppUploaded,
                &BundleRequest {
                    hash: request.hash.clone(),
                },
            )
            .await?;
        if uploaded.value {
            return Ok(());
        }

        let _: Value = self.call(identifier, RpcMethod::UploadApp, request).await?;
        let until = Instant::now() + deadline;

        loop {
            let progress: UploadAppProgressResponse = self
                .call(
                    identifier,
                    RpcMethod::UploadAppProgress,
                    &UploadAppProgressRequest {
                        app_id: request.app_id,
                    },
                )
                .await?;
            if progress.completed {
                info!(
                    "Upload of {} to {} complete ({} bytes)",
                    request.name, identifier, progress.data_received
                );
                return Ok(());
            }
            if progress.failed {
                return Err(HubError::Transport(format!(
                    "upload of {} to {} failed",
                    request.name, identifier
                )));
            }
            if Instant::now() >= until {
                return Err(HubError::ActionTimeout(RpcMethod::UploadApp.as_str().to_string()));
            }
            tokio::time::sleep(UPLOAD_POLL_INTERVAL).await;
        }
    }
}
