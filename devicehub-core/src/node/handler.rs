use async_trait::async_trait;
use devicehub_protocol::rpc::{DeviceRequest, DevicesResponse};
use devicehub_protocol::{ConnectionState, DeviceState, RpcMethod};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::device::NodeDevice;
use super::manager::{NodeManager, NodeStatus};
use super::NODE_MANAGER;
use crate::device::{Device, DeviceDetails, DeviceHandler};
use crate::error::{HubError, Result};

/// Unforced refreshes ask nodes for their devices at most this often
pub const NODE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Exposes the devices of every connected node as [`NodeDevice`] proxies
pub struct NodeHandler {
    nodes: Arc<NodeManager>,
    devices: RwLock<HashMap<String, Arc<NodeDevice>>>,
    last_refresh: Mutex<Option<Instant>>,
    this: Weak<NodeHandler>,
}

impl NodeHandler {
    pub fn new(nodes: Arc<NodeManager>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            nodes,
            devices: RwLock::new(HashMap::new()),
            last_refresh: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub async fn proxy(&self, device_id: &str) -> Result<Arc<NodeDevice>> {
        self.devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| HubError::DeviceNotFound(device_id.to_string()))
    }

    async fn due(&self, force: bool) -> bool {
        let mut last = self.last_refresh.lock().await;
        let due = force || last.map_or(true, |t| t.elapsed() >= NODE_REFRESH_INTERVAL);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// Pull the device list of one node into proxies; returns the ids seen
    async fn sync_node(&self, node_id: &str) -> Result<HashSet<String>> {
        let response: DevicesResponse = self
            .nodes
            .call(node_id, RpcMethod::GetDevices, &Value::Null)
            .await?;

        let mut seen = HashSet::new();
        for (manager, infos) in response.managers {
            for info in infos {
                let details = DeviceDetails {
                    name: info.name.clone(),
                    model: info.model.clone(),
                    os_name: info.os_name.clone(),
                    os_version: info.os_version.clone(),
                };

                let existing = self.devices.read().await.get(&info.device_id).cloned();
                let proxy = match existing {
                    Some(proxy) if proxy.node_id() == node_id => {
                        proxy.core().set_details(details).await;
                        proxy
                    }
                    _ => {
                        debug!("New device {} on node {}", info.device_id, node_id);
                        let proxy = Arc::new(NodeDevice::new(
                            Arc::clone(&self.nodes),
                            node_id,
                            manager.clone(),
                            info.device_id.clone(),
                            details,
                        ));
                        self.devices
                            .write()
                            .await
                            .insert(info.device_id.clone(), Arc::clone(&proxy));
                        proxy
                    }
                };

                // the remote lock belongs to the node; only the lifecycle state is mirrored
                let state = match info.state {
                    DeviceState::Locked => DeviceState::Booted,
                    other => other,
                };
                proxy.core().set_state(state).await;
                proxy
                    .core()
                    .set_remote_connected(info.connection_state == ConnectionState::Connected)
                    .await;
                seen.insert(info.device_id);
            }
        }
        Ok(seen)
    }

    /// Refresh whenever a node registers
    async fn watch_registrations(self: Arc<Self>, mut registrations: broadcast::Receiver<String>) {
        loop {
            match registrations.recv().await {
                Ok(node_id) => {
                    info!("Node {} connected, refreshing devices", node_id);
                    if let Err(e) = self.refresh_devices(true).await {
                        warn!("Refresh after registration of {} failed: {}", node_id, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Missed {} node registrations", missed);
                    let _ = self.refresh_devices(true).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[async_trait]
impl DeviceHandler for NodeHandler {
    fn name(&self) -> &str {
        NODE_MANAGER
    }

    async fn start(&self) -> Result<()> {
        if let Some(this) = self.this.upgrade() {
            let registrations = self.nodes.subscribe();
            tokio::spawn(this.watch_registrations(registrations));
        }
        Ok(())
    }

    async fn start_device(&self, device_id: &str) -> Result<()> {
        let proxy = self.proxy(device_id).await?;
        let _: Value = self
            .nodes
            .call(
                proxy.node_id(),
                RpcMethod::StartDevice,
                &DeviceRequest {
                    device_id: device_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn stop_device(&self, device_id: &str) -> Result<()> {
        let proxy = self.proxy(device_id).await?;
        let _: Value = self
            .nodes
            .call(
                proxy.node_id(),
                RpcMethod::StopDevice,
                &DeviceRequest {
                    device_id: device_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices
            .read()
            .await
            .values()
            .map(|d| Arc::clone(d) as Arc<dyn Device>)
            .collect()
    }

    async fn refresh_devices(&self, force: bool) -> Result<()> {
        if !self.due(force).await {
            return Ok(());
        }

        let mut seen = HashSet::new();
        for node in self.nodes.nodes().await {
            if node.status().await != NodeStatus::Connected {
                continue;
            }
            match self.sync_node(&node.identifier).await {
                Ok(ids) => seen.extend(ids),
                Err(e) => warn!("GetDevices on {} failed: {}", node.identifier, e),
            }
        }

        let proxies: Vec<Arc<NodeDevice>> = self.devices.read().await.values().cloned().collect();
        for proxy in proxies {
            if !seen.contains(proxy.core().id()) {
                proxy.core().set_state(DeviceState::NodeDisconnected).await;
                proxy.core().set_remote_connected(false).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::node::client::NodeClient;
    use devicehub_protocol::rpc::RegisterNodeRequest;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NodeWithDevices {
        gone: AtomicBool,
        listings: AtomicUsize,
    }

    #[async_trait]
    impl NodeClient for NodeWithDevices {
        async fn call(&self, method: RpcMethod, _params: Value) -> Result<Value> {
            if self.gone.load(Ordering::SeqCst) {
                return Err(HubError::NodeNotConnected("node-a".to_string()));
            }
            match method {
                RpcMethod::GetDevices => {
                    self.listings.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({
                        "managers": {
                            "android_device": [{
                                "deviceId": "emulator-5554",
                                "name": "Pixel 7",
                                "osName": "Android",
                                "state": "booted",
                                "connectionState": "connected"
                            }]
                        }
                    }))
                }
                _ => Ok(Value::Null),
            }
        }

        fn is_closed(&self) -> bool {
            self.gone.load(Ordering::SeqCst)
        }

        async fn close(&self) {}
    }

    async fn setup() -> (Arc<NodeManager>, Arc<NodeHandler>, Arc<NodeWithDevices>) {
        let nodes = Arc::new(NodeManager::new(&Timeouts::default()));
        let handler = NodeHandler::new(Arc::clone(&nodes));
        let client = Arc::new(NodeWithDevices {
            gone: AtomicBool::new(false),
            listings: AtomicUsize::new(0),
        });
        nodes
            .register_node(
                RegisterNodeRequest {
                    identifier: "node-a".to_string(),
                    hostname: String::new(),
                    operation_system: String::new(),
                    environment_variables: String::new(),
                    port: 0,
                    managers: vec!["android_device".to_string()],
                },
                "10.0.0.2",
                client.clone(),
            )
            .await;
        (nodes, handler, client)
    }

    #[tokio::test]
    async fn test_refresh_creates_proxies() {
        let (_nodes, handler, _client) = setup().await;
        handler.refresh_devices(true).await.unwrap();

        let devices = handler.devices().await;
        assert_eq!(devices.len(), 1);
        let info = devices[0].info().await;
        assert_eq!(info.device_id, "emulator-5554");
        assert_eq!(info.name, "Pixel 7");
        assert_eq!(info.state, DeviceState::Booted);
        assert_eq!(info.connection_state, ConnectionState::Connected);
        assert_eq!(devices[0].manager(), "node");
    }

    #[tokio::test]
    async fn test_unforced_refresh_is_throttled() {
        let (_nodes, handler, client) = setup().await;
        handler.refresh_devices(false).await.unwrap();
        handler.refresh_devices(false).await.unwrap();
        assert_eq!(client.listings.load(Ordering::SeqCst), 1);

        handler.refresh_devices(true).await.unwrap();
        assert_eq!(client.listings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_devices_marked_node_disconnected() {
        let (nodes, handler, client) = setup().await;
        handler.refresh_devices(true).await.unwrap();

        client.gone.store(true, Ordering::SeqCst);
        nodes.health_check().await;
        handler.refresh_devices(true).await.unwrap();

        let proxy = handler.proxy("emulator-5554").await.unwrap();
        assert_eq!(proxy.core().state().await, DeviceState::NodeDisconnected);
        assert!(!proxy.core().is_connected().await);
    }

    #[tokio::test]
    async fn test_registration_triggers_refresh() {
        let nodes = Arc::new(NodeManager::new(&Timeouts::default()));
        let handler = NodeHandler::new(Arc::clone(&nodes));
        handler.start().await.unwrap();

        let client = Arc::new(NodeWithDevices {
            gone: AtomicBool::new(false),
            listings: AtomicUsize::new(0),
        });
        nodes
            .register_node(
                RegisterNodeRequest {
                    identifier: "node-b".to_string(),
                    hostname: String::new(),
                    operation_system: String::new(),
                    environment_variables: String::new(),
                    port: 0,
                    managers: vec![],
                },
                "10.0.0.4",
                client.clone(),
            )
            .await;

        for _ in 0..100 {
            if handler.has_device("emulator-5554").await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registration did not trigger a refresh");
    }
}
