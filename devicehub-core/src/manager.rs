//! Device manager: handler registry, agent socket listener and the single
//! entry point for sending actions to a device.

use devicehub_protocol::action::Connect;
use devicehub_protocol::{read_frame, DeviceInfo, Request, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::config::Timeouts;
use crate::device::{Connection, Device, DeviceHandler, DeviceProperties, Inbound};
use crate::error::{HubError, Result};

pub struct DeviceManager {
    handlers: RwLock<Vec<Arc<dyn DeviceHandler>>>,
    /// session id -> device id, used when an agent handshakes without a device id
    sessions: RwLock<HashMap<String, String>>,
    read_timeout: Duration,
    action_timeout: Duration,
    refresh_period: Duration,
}

impl DeviceManager {
    pub fn new(timeouts: &Timeouts) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            sessions: RwLock::new(HashMap::new()),
            read_timeout: timeouts.read(),
            action_timeout: timeouts.action(),
            refresh_period: timeouts.refresh(),
        }
    }

    pub fn action_timeout(&self) -> Duration {
        self.action_timeout
    }

    /// Register a handler; one per manager name, a later one replaces it
    pub async fn add_handler(&self, handler: Arc<dyn DeviceHandler>) {
        let mut handlers = self.handlers.write().await;
        if let Some(pos) = handlers.iter().position(|h| h.name() == handler.name()) {
            warn!("Replacing handler {}", handler.name());
            handlers[pos] = handler;
        } else {
            info!("Added handler {}", handler.name());
            handlers.push(handler);
        }
    }

    pub async fn handler(&self, name: &str) -> Result<Arc<dyn DeviceHandler>> {
        self.handlers
            .read()
            .await
            .iter()
            .find(|h| h.name() == name)
            .cloned()
            .ok_or_else(|| HubError::ManagerNotFound(name.to_string()))
    }

    pub async fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .await
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    async fn handler_snapshot(&self) -> Vec<Arc<dyn DeviceHandler>> {
        self.handlers.read().await.clone()
    }

    /// Every device across all handlers
    pub async fn devices(&self) -> Vec<Arc<dyn Device>> {
        let mut devices = Vec::new();
        for handler in self.handler_snapshot().await {
            devices.extend(handler.devices().await);
        }
        devices
    }

    /// Device infos grouped by handler name
    pub async fn devices_by_manager(&self) -> HashMap<String, Vec<DeviceInfo>> {
        let mut result = HashMap::new();
        for handler in self.handler_snapshot().await {
            let mut infos = Vec::new();
            for device in handler.devices().await {
                infos.push(device.info().await);
            }
            result.insert(handler.name().to_string(), infos);
        }
        result
    }

    /// Device with `device_id` and the name of the handler owning it
    pub async fn get_device(&self, device_id: &str) -> Result<(Arc<dyn Device>, String)> {
        for handler in self.handler_snapshot().await {
            if let Some(device) = handler
                .devices()
                .await
                .into_iter()
                .find(|d| d.device_id() == device_id)
            {
                return Ok((device, handler.name().to_string()));
            }
        }
        Err(HubError::DeviceNotFound(device_id.to_string()))
    }

    /// First unlocked device matching `properties`
    pub async fn find_device(&self, properties: &DeviceProperties) -> Result<Arc<dyn Device>> {
        for handler in self.handler_snapshot().await {
            for device in handler.devices().await {
                if device.core().is_locked().await {
                    continue;
                }
                let info = device.info().await;
                if properties.matches(handler.name(), &info) {
                    return Ok(device);
                }
            }
        }
        Err(HubError::NoDeviceAvailable)
    }

    pub async fn start(&self, device_id: &str) -> Result<()> {
        let (_, manager) = self.get_device(device_id).await?;
        self.handler(&manager).await?.start_device(device_id).await
    }

    pub async fn stop(&self, device_id: &str) -> Result<()> {
        let (_, manager) = self.get_device(device_id).await?;
        self.handler(&manager).await?.stop_device(device_id).await
    }

    pub async fn bind_session(&self, session_id: &str, device_id: &str) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), device_id.to_string());
    }

    pub async fn unbind_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Ask every handler to refresh right away
    pub async fn refresh(&self, force: bool) {
        for handler in self.handler_snapshot().await {
            if let Err(e) = handler.refresh_devices(force).await {
                debug!("Refresh of {} failed: {}", handler.name(), e);
            }
        }
    }

    /// Send one action and wait for its response
    ///
    /// Only one action is in flight per device; concurrent callers queue on
    /// the device. The request carries a fresh action id so late answers to
    /// an earlier, timed out action are not mistaken for this one.
    pub async fn send_action(&self, device: &Arc<dyn Device>, action: &mut dyn Action) -> Result<()> {
        let mut request = action.request();
        request.action_id = uuid::Uuid::new_v4().to_string();
        let bytes = request.encode()?;

        let core = device.core();
        let guard = core.begin_action(&request.action_id, request.action_type).await;

        info!(
            "Send action {} ({}) to {}",
            request.action_type,
            request.action_id,
            device.device_id()
        );
        device.send(bytes).await?;

        let response = tokio::time::timeout(self.action_timeout, guard.next_response())
            .await
            .map_err(|_| HubError::ActionTimeout(request.action_type.to_string()))?;
        drop(guard);

        match response {
            Some(response) => action.accept(&response),
            None => Err(HubError::DeviceDisconnected),
        }
    }

    /// Write a request without waiting; the answer reaches the device's
    /// action handlers
    pub async fn post_request(&self, device: &Arc<dyn Device>, request: &Request) -> Result<()> {
        let bytes = request.encode()?;
        info!(
            "Post action {} ({}) to {}",
            request.action_type,
            request.action_id,
            device.device_id()
        );
        device.send(bytes).await
    }

    /// Initialize and start all handlers, then accept agent connections on
    /// `listener` and refresh device lists until `shutdown` flips to true
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        debug!("Starting device manager");

        for handler in self.handler_snapshot().await {
            if let Err(e) = handler.init().await {
                error!("Init of handler {} failed: {}", handler.name(), e);
            }
            if let Err(e) = handler.start().await {
                error!("Start of handler {} failed: {}", handler.name(), e);
            }
        }

        let refresher = Arc::clone(&self);
        let refresh_shutdown = shutdown.clone();
        tokio::spawn(async move { refresher.refresh_loop(refresh_shutdown).await });

        info!("Listening for devices on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            info!("Device socket accepted: {}", addr);
                            let manager = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = manager.handle_connection(stream, addr.to_string()).await {
                                    warn!("Handshake from {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                _ = shutdown.changed() => {
                    info!("Stop DeviceManager");
                    break;
                }
            }
        }

        for handler in self.handler_snapshot().await {
            if let Err(e) = handler.stop().await {
                warn!("Stop of handler {} failed: {}", handler.name(), e);
            }
        }
        Ok(())
    }

    async fn refresh_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.refresh_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh(false).await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Refresh loop stopped");
    }

    /// Read the handshake, bind the socket to its device and start the
    /// read and dispatch tasks
    async fn handle_connection(&self, mut stream: TcpStream, peer: String) -> Result<()> {
        let frame = tokio::time::timeout(self.read_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| HubError::ConnectionTimeout)??;
        let handshake = Response::decode(&frame)?;
        let Some(params) = handshake.payload.connect else {
            return Err(HubError::UnexpectedResponse(format!(
                "first message from {} is {} without connect payload",
                peer, handshake.action_type
            )));
        };

        let device = self.lookup_connecting(&params).await?;
        info!("Received Handshake from {} for {}", peer, device.device_id());

        let (connection, inbound) = Connection::new(stream, params, peer, self.read_timeout);
        if let Some(previous) = device.core().set_connection(Arc::clone(&connection)).await {
            info!("Closing previous connection of {}", device.device_id());
            previous.close().await;
        }

        let reader = Arc::clone(&connection);
        tokio::spawn(async move { reader.handle_messages().await });
        tokio::spawn(dispatch_inbound(device, connection, inbound));
        Ok(())
    }

    async fn lookup_connecting(&self, params: &Connect) -> Result<Arc<dyn Device>> {
        if !params.device_id.is_empty() {
            if let Ok((device, _)) = self.get_device(&params.device_id).await {
                return Ok(device);
            }
        }
        if !params.session_id.is_empty() {
            let bound = self.sessions.read().await.get(&params.session_id).cloned();
            if let Some(device_id) = bound {
                return Ok(self.get_device(&device_id).await?.0);
            }
        }
        Err(HubError::DeviceNotFound(format!(
            "{} (session {})",
            params.device_id, params.session_id
        )))
    }
}

/// Decode queued agent messages into the device until the connection ends
async fn dispatch_inbound(
    device: Arc<dyn Device>,
    connection: Arc<Connection>,
    mut inbound: mpsc::Receiver<Inbound>,
) {
    while let Some(message) = inbound.recv().await {
        match message {
            Inbound::Message(bytes) => match Response::decode(&bytes) {
                Ok(response) => device.core().dispatch_response(response).await,
                Err(e) => warn!("Undecodable message from {}: {}", device.device_id(), e),
            },
            Inbound::Disconnected => break,
        }
    }
    device.core().connection_lost(&connection).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::GetScreenshot;
    use crate::config::{DeviceConfig, ManagerConfig, PlatformCommands};
    use crate::device::{Platform, StaticHandler};
    use devicehub_protocol::action::Screenshot;
    use devicehub_protocol::{write_frame, ActionType};
    use std::io::Cursor;
    use std::net::SocketAddr;

    fn handler(ids: &[&str]) -> Arc<dyn DeviceHandler> {
        let config = ManagerConfig {
            enabled: true,
            commands: PlatformCommands::default(),
            devices: ids
                .iter()
                .map(|id| DeviceConfig {
                    id: id.to_string(),
                    ..Default::default()
                })
                .collect(),
            connection_timeout_secs: None,
        };
        Arc::new(StaticHandler::new(Platform::MacOs, &config))
    }

    async fn start(ids: &[&str]) -> (Arc<DeviceManager>, SocketAddr, watch::Sender<bool>) {
        let manager = Arc::new(DeviceManager::new(&Timeouts::default()));
        manager.add_handler(handler(ids)).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&manager).run(listener, shutdown_rx));
        (manager, addr, shutdown_tx)
    }

    async fn connect_agent(addr: SocketAddr, device_id: &str, session_id: &str) -> TcpStream {
        let mut agent = TcpStream::connect(addr).await.unwrap();
        let handshake = Response::connect(Connect {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            ..Default::default()
        });
        write_frame(&mut agent, &handshake.encode().unwrap()).await.unwrap();
        agent
    }

    async fn wait_connected(device: &Arc<dyn Device>, expected: bool) {
        for _ in 0..200 {
            if device.core().is_connected().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("device {} never reached connected={}", device.device_id(), expected);
    }

    fn png() -> Vec<u8> {
        let img = image::RgbaImage::new(8, 4);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn test_screenshot_round_trip_over_socket() {
        let (manager, addr, _shutdown) = start(&["dev-1"]).await;
        let mut agent = connect_agent(addr, "dev-1", "").await;

        let (device, manager_name) = manager.get_device("dev-1").await.unwrap();
        assert_eq!(manager_name, "macos");
        wait_connected(&device, true).await;

        tokio::spawn(async move {
            let frame = read_frame(&mut agent).await.unwrap();
            let request = Request::decode(&frame).unwrap();
            assert_eq!(request.action_type, ActionType::GetScreenshot);
            assert!(!request.action_id.is_empty());

            let mut response = Response::new(ActionType::GetScreenshot, true);
            response.action_id = request.action_id;
            response.payload.screenshot = Some(Screenshot {
                screenshot: png(),
                ..Default::default()
            });
            write_frame(&mut agent, &response.encode().unwrap()).await.unwrap();
            // keep the socket open until the test ends
            let _ = read_frame(&mut agent).await;
        });

        let mut action = GetScreenshot::new();
        manager.send_action(&device, &mut action).await.unwrap();
        assert!(action.success);
        assert!(!action.data().is_empty());
        assert_eq!((action.width, action.height), (8, 4));
    }

    #[tokio::test]
    async fn test_peer_close_mid_call_is_disconnect() {
        let (manager, addr, _shutdown) = start(&["dev-1"]).await;
        let mut agent = connect_agent(addr, "dev-1", "").await;
        let (device, _) = manager.get_device("dev-1").await.unwrap();
        wait_connected(&device, true).await;

        tokio::spawn(async move {
            let _ = read_frame(&mut agent).await;
            drop(agent);
        });

        let mut action = GetScreenshot::new();
        let err = manager.send_action(&device, &mut action).await.unwrap_err();
        assert!(matches!(err, HubError::DeviceDisconnected), "got {:?}", err);
        wait_connected(&device, false).await;
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_fast() {
        let (manager, _addr, _shutdown) = start(&["dev-1"]).await;
        let (device, _) = manager.get_device("dev-1").await.unwrap();

        let mut action = GetScreenshot::new();
        let err = manager.send_action(&device, &mut action).await.unwrap_err();
        assert_eq!(err.to_string(), "device not connected");
    }

    #[tokio::test]
    async fn test_handshake_by_session_id() {
        let (manager, addr, _shutdown) = start(&["dev-1", "dev-2"]).await;
        manager.bind_session("session-7", "dev-2").await;

        let _agent = connect_agent(addr, "", "session-7").await;
        let (device, _) = manager.get_device("dev-2").await.unwrap();
        wait_connected(&device, true).await;
        assert!(!manager.get_device("dev-1").await.unwrap().0.core().is_connected().await);
    }

    #[tokio::test]
    async fn test_unknown_device_handshake_dropped() {
        let (_manager, addr, _shutdown) = start(&["dev-1"]).await;
        let mut agent = connect_agent(addr, "ghost", "").await;

        let result = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut agent)).await;
        assert!(matches!(result, Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_second_handshake_replaces_connection() {
        let (manager, addr, _shutdown) = start(&["dev-1"]).await;
        let mut first = connect_agent(addr, "dev-1", "").await;
        let (device, _) = manager.get_device("dev-1").await.unwrap();
        wait_connected(&device, true).await;
        let original = device.core().connection().await.unwrap();

        let _second = connect_agent(addr, "dev-1", "").await;
        for _ in 0..200 {
            let current = device.core().connection().await;
            if current.is_some_and(|c| !Arc::ptr_eq(&c, &original)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // first socket is closed by the hub
        assert!(read_frame(&mut first).await.is_err());
        assert!(original.is_closed());
        assert!(device.core().is_connected().await);
    }

    #[tokio::test]
    async fn test_find_device_skips_locked() {
        let (manager, _addr, _shutdown) = start(&["dev-1", "dev-2"]).await;
        let (first, _) = manager.get_device("dev-1").await.unwrap();
        first.core().lock().await.unwrap();

        let found = manager.find_device(&DeviceProperties::default()).await.unwrap();
        assert_eq!(found.device_id(), "dev-2");
        found.core().lock().await.unwrap();

        assert!(matches!(
            manager.find_device(&DeviceProperties::default()).await,
            Err(HubError::NoDeviceAvailable)
        ));
    }

    #[tokio::test]
    async fn test_start_stop_unknown_device() {
        let (manager, _addr, _shutdown) = start(&["dev-1"]).await;
        manager.start("dev-1").await.unwrap();
        assert!(matches!(
            manager.stop("nope").await,
            Err(HubError::DeviceNotFound(_))
        ));
        assert!(matches!(
            manager.handler("android_device").await,
            Err(HubError::ManagerNotFound(_))
        ));
    }
}
