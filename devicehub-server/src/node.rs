use anyhow::{Context, Result};
use devicehub_core::config::hostname;
use devicehub_core::device::StaticHandler;
use devicehub_core::node::{AppBundleStore, MasterCallbacks, ReconnectHandler, RpcNodeService};
use devicehub_core::{DeviceManager, HubConfig};
use devicehub_protocol::rpc::RegisterNodeRequest;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::tunnel::{self, Inbound};

/// Pause between two attempts to reach the master
const REDIAL_DELAY: Duration = Duration::from_secs(5);

/// Websocket URL of the master's registration endpoint
pub fn connect_url(master: &str) -> String {
    let master = master.trim_end_matches('/');
    if let Some(rest) = master.strip_prefix("https://") {
        format!("wss://{}/node/connect", rest)
    } else if let Some(rest) = master.strip_prefix("http://") {
        format!("ws://{}/node/connect", rest)
    } else {
        format!("ws://{}/node/connect", master)
    }
}

fn classify(message: Message) -> Inbound {
    match message {
        Message::Binary(bytes) => Inbound::Frame(bytes.to_vec()),
        Message::Close(_) => Inbound::Close,
        _ => Inbound::Ignore,
    }
}

struct NodeContext {
    config: HubConfig,
    devices: Arc<DeviceManager>,
    service: Arc<RpcNodeService>,
    reconnect: Arc<ReconnectHandler>,
}

impl NodeContext {
    async fn registration(&self) -> RegisterNodeRequest {
        RegisterNodeRequest {
            identifier: self.config.identifier.clone(),
            hostname: hostname(),
            operation_system: std::env::consts::OS.to_string(),
            environment_variables: std::env::var("PATH").unwrap_or_default(),
            port: self.config.device_port,
            managers: self.devices.handler_names().await,
        }
    }

    /// Dial, register and serve until the tunnel dies or `shutdown` fires
    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let url = connect_url(&self.config.master_url);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to reach master at {}", url))?;
        let (mut sink, stream) = socket.split();

        let registration = serde_json::to_vec(&self.registration().await)?;
        sink.send(Message::Binary(registration.into()))
            .await
            .context("Failed to register with master")?;
        info!("Registered with master at {}", self.config.master_url);

        let (outgoing, incoming) =
            tunnel::bridge(sink, stream, |bytes| Message::Binary(bytes.into()), classify);
        self.reconnect.reset().await;
        let mut serve = tokio::spawn(Arc::clone(&self.service).serve(incoming, outgoing));

        tokio::select! {
            _ = self.reconnect.wait_stale() => warn!("No ping from master, reconnecting"),
            _ = &mut serve => info!("Master closed the connection"),
            _ = shutdown.changed() => {}
        }
        serve.abort();
        Ok(())
    }
}

/// Run a node until `shutdown` flips to true
pub async fn run(config: HubConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let timeouts = config.timeouts.clone();
    let devices = Arc::new(DeviceManager::new(&timeouts));
    for (platform, manager) in config.enabled_managers() {
        devices
            .add_handler(Arc::new(StaticHandler::new(platform, manager)))
            .await;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.device_port))
        .await
        .with_context(|| format!("Failed to bind device port {}", config.device_port))?;
    info!("Accepting device connections on port {}", config.device_port);
    let device_task = tokio::spawn(Arc::clone(&devices).run(listener, shutdown.clone()));

    let callbacks = Arc::new(MasterCallbacks::new(&config.master_url, &config.identifier)?);
    let attach_devices = Arc::clone(&devices);
    let mut attach_shutdown = shutdown.clone();
    let attach_period = timeouts.ping_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(attach_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => callbacks.attach(&attach_devices).await,
                _ = attach_shutdown.changed() => break,
            }
        }
    });

    let reconnect = Arc::new(ReconnectHandler::new(
        timeouts.ping_stale(),
        timeouts.ping_interval(),
    ));
    let service = Arc::new(
        RpcNodeService::new(
            Arc::clone(&devices),
            Arc::new(AppBundleStore::new(config.bundle_dir())),
            config.node_url.clone(),
        )
        .with_reconnect(Arc::clone(&reconnect)),
    );

    let context = NodeContext {
        config,
        devices,
        service,
        reconnect,
    };

    info!("Node {} starting", context.config.identifier);
    while !*shutdown.borrow() {
        if let Err(e) = context.session(&mut shutdown).await {
            warn!("{:#}", e);
        }
        if *shutdown.borrow() {
            break;
        }
        debug!("Redialing master in {:?}", REDIAL_DELAY);
        tokio::select! {
            _ = tokio::time::sleep(REDIAL_DELAY) => {}
            _ = shutdown.changed() => {}
        }
    }

    let _ = device_task.await;
    info!("Node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url() {
        assert_eq!(connect_url("10.0.0.1:8002"), "ws://10.0.0.1:8002/node/connect");
        assert_eq!(
            connect_url("http://hub.local:8002/"),
            "ws://hub.local:8002/node/connect"
        );
        assert_eq!(
            connect_url("https://hub.example.com"),
            "wss://hub.example.com/node/connect"
        );
    }
}
