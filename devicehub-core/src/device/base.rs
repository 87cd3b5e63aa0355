use devicehub_protocol::{ActionType, ConnectionState, DeviceInfo, DeviceState, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use super::connection::Connection;
use super::{ActionHandler, LogWriter, TracingLogWriter};
use crate::error::{HubError, Result};

/// Descriptive fields that may change when a handler refreshes its devices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDetails {
    pub name: String,
    pub model: String,
    pub os_name: String,
    pub os_version: String,
}

/// Identifies a registered action handler for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone)]
struct Outstanding {
    action_id: String,
    action_type: ActionType,
}

/// State shared by every device variant: lock flag, agent connection,
/// action handlers and the single-slot response queue.
pub struct DeviceCore {
    id: String,
    details: RwLock<DeviceDetails>,
    state: RwLock<DeviceState>,
    locked: Mutex<bool>,
    connection: RwLock<Option<Arc<Connection>>>,
    remote_connected: RwLock<bool>,
    handlers: RwLock<Vec<(HandlerId, Arc<dyn ActionHandler>)>>,
    next_handler_id: AtomicU64,
    log_writer: RwLock<Arc<dyn LogWriter>>,
    response_tx: mpsc::Sender<Option<Response>>,
    response_rx: Mutex<mpsc::Receiver<Option<Response>>>,
    outstanding: std::sync::Mutex<Option<Outstanding>>,
    action_lock: Mutex<()>,
}

impl DeviceCore {
    pub fn new(id: impl Into<String>, details: DeviceDetails) -> Self {
        let id = id.into();
        let (response_tx, response_rx) = mpsc::channel(1);
        Self {
            log_writer: RwLock::new(Arc::new(TracingLogWriter::new(&id))),
            id,
            details: RwLock::new(details),
            state: RwLock::new(DeviceState::Unknown),
            locked: Mutex::new(false),
            connection: RwLock::new(None),
            remote_connected: RwLock::new(false),
            handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            response_tx,
            response_rx: Mutex::new(response_rx),
            outstanding: std::sync::Mutex::new(None),
            action_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn details(&self) -> DeviceDetails {
        self.details.read().await.clone()
    }

    pub async fn set_details(&self, details: DeviceDetails) {
        *self.details.write().await = details;
    }

    pub async fn state(&self) -> DeviceState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: DeviceState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!("Device {} state {} -> {}", self.id, *current, state);
            *current = state;
        }
    }

    pub async fn info(&self) -> DeviceInfo {
        let details = self.details().await;
        let state = if self.is_locked().await {
            DeviceState::Locked
        } else {
            self.state().await
        };
        DeviceInfo {
            device_id: self.id.clone(),
            name: details.name,
            model: details.model,
            os_name: details.os_name,
            os_version: details.os_version,
            state,
            connection_state: if self.is_connected().await {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
        }
    }

    /// Take exclusive ownership; not reentrant
    pub async fn lock(&self) -> Result<()> {
        let mut locked = self.locked.lock().await;
        if *locked {
            return Err(HubError::DeviceAlreadyLocked);
        }
        *locked = true;
        Ok(())
    }

    pub async fn unlock(&self) -> Result<()> {
        let mut locked = self.locked.lock().await;
        if !*locked {
            return Err(HubError::DeviceNotLocked);
        }
        *locked = false;
        Ok(())
    }

    pub async fn is_locked(&self) -> bool {
        *self.locked.lock().await
    }

    /// Install a new agent connection, returning the one it replaces
    pub async fn set_connection(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let params = connection.params();
        self.log_writer.read().await.log(
            "device",
            &format!(
                "Device Connected: DeviceID: {} SessionID: {} AppType: {} Version: {}",
                params.device_id, params.session_id, params.app_type, params.version
            ),
        );
        self.connection.write().await.replace(connection)
    }

    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().await.clone()
    }

    /// Connected either through a local socket or, for proxies, as last
    /// reported by the remote side
    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some() || *self.remote_connected.read().await
    }

    pub async fn set_remote_connected(&self, connected: bool) {
        *self.remote_connected.write().await = connected;
    }

    /// Write raw bytes to the agent connection
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let connection = self.connection().await;
        match connection {
            Some(c) => c.send(data).await,
            None => Err(HubError::DeviceNotConnected),
        }
    }

    /// Read loop of `connection` ended
    ///
    /// Only the live connection counts: it is cleared and handlers and any
    /// waiting caller see a disconnect. A replaced connection is ignored.
    pub async fn connection_lost(&self, connection: &Arc<Connection>) {
        let was_current = {
            let mut current = self.connection.write().await;
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(c, connection) => {
                    current.take();
                    true
                }
                _ => false,
            }
        };

        if was_current {
            self.log_writer.read().await.log("device", "Device Disconnected");
            self.dispatch_disconnect().await;
        } else {
            debug!("Replaced connection for {} finished", self.id);
        }
    }

    pub async fn set_log_writer(&self, writer: Arc<dyn LogWriter>) {
        *self.log_writer.write().await = writer;
    }

    pub async fn log_writer(&self) -> Arc<dyn LogWriter> {
        self.log_writer.read().await.clone()
    }

    pub async fn add_action_handler(&self, handler: Arc<dyn ActionHandler>) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().await.push((id, handler));
        id
    }

    pub async fn remove_action_handler(&self, id: HandlerId) {
        self.handlers.write().await.retain(|(h, _)| *h != id);
    }

    pub async fn has_action_handlers(&self) -> bool {
        !self.handlers.read().await.is_empty()
    }

    async fn handler_snapshot(&self) -> Vec<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .await
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }

    /// Route one response from the agent
    ///
    /// Registered handlers take every response. Without handlers, log and
    /// performance reports go to the log writer and anything else fills the
    /// response slot of the waiting caller.
    pub async fn dispatch_response(&self, response: Response) {
        let handlers = self.handler_snapshot().await;
        if !handlers.is_empty() {
            for handler in handlers {
                handler.on_action_response(&self.id, Some(&response)).await;
            }
            return;
        }

        let outstanding = self.outstanding_action();
        let awaited = outstanding
            .as_ref()
            .is_some_and(|o| o.action_type == response.action_type);

        if !awaited && self.write_report(&response).await {
            return;
        }

        match outstanding {
            None => {
                debug!(
                    "Dropping unsolicited {} response from {}",
                    response.action_type, self.id
                );
            }
            Some(o) if !response.action_id.is_empty() && response.action_id != o.action_id => {
                debug!(
                    "Dropping {} response {} from {}, waiting for {}",
                    response.action_type, response.action_id, self.id, o.action_id
                );
            }
            Some(_) => self.release_waiter(Some(response)),
        }
    }

    /// Tell handlers and any waiting caller that the agent is gone
    pub async fn dispatch_disconnect(&self) {
        for handler in self.handler_snapshot().await {
            handler.on_action_response(&self.id, None).await;
        }
        self.release_waiter(None);
    }

    async fn write_report(&self, response: &Response) -> bool {
        let writer = self.log_writer().await;
        match response.action_type {
            ActionType::Log => {
                if let Some(log) = &response.payload.log_data {
                    writer.app_log(log);
                }
                true
            }
            ActionType::Performance => {
                if let Some(perf) = &response.payload.performance_data {
                    writer.performance(perf, "");
                }
                true
            }
            _ => false,
        }
    }

    fn release_waiter(&self, response: Option<Response>) {
        if self.outstanding_action().is_none() {
            return;
        }
        if self.response_tx.try_send(response).is_err() {
            warn!("Response slot for {} already full, dropping", self.id);
        }
    }

    fn outstanding_action(&self) -> Option<Outstanding> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Serialize request/response exchanges: at most one outstanding action
    pub async fn begin_action(&self, action_id: &str, action_type: ActionType) -> ActionGuard<'_> {
        let guard = self.action_lock.lock().await;

        let mut rx = self.response_rx.lock().await;
        while let Ok(stale) = rx.try_recv() {
            debug!("Discarding stale response for {}: {:?}", self.id, stale.map(|r| r.action_type));
        }
        drop(rx);

        *self
            .outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Outstanding {
            action_id: action_id.to_string(),
            action_type,
        });

        ActionGuard {
            core: self,
            _guard: guard,
        }
    }
}

/// Held for the duration of one action exchange
pub struct ActionGuard<'a> {
    core: &'a DeviceCore,
    _guard: MutexGuard<'a, ()>,
}

impl ActionGuard<'_> {
    /// Wait for the response slot; `None` means the agent disconnected
    pub async fn next_response(&self) -> Option<Response> {
        self.core.response_rx.lock().await.recv().await.flatten()
    }
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        *self
            .core
            .outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use devicehub_protocol::action::Connect;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Option<ActionType>>>,
    }

    #[async_trait]
    impl ActionHandler for Recorder {
        async fn on_action_response(&self, _device_id: &str, response: Option<&Response>) {
            self.seen.lock().await.push(response.map(|r| r.action_type));
        }
    }

    fn core() -> DeviceCore {
        DeviceCore::new("dev-1", DeviceDetails::default())
    }

    #[tokio::test]
    async fn test_lock_twice_fails() {
        let core = core();
        core.lock().await.unwrap();
        assert!(matches!(core.lock().await, Err(HubError::DeviceAlreadyLocked)));
        assert_eq!(core.info().await.state, DeviceState::Locked);
    }

    #[tokio::test]
    async fn test_unlock_twice_fails() {
        let core = core();
        core.lock().await.unwrap();
        core.unlock().await.unwrap();
        assert!(matches!(core.unlock().await, Err(HubError::DeviceNotLocked)));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let err = core().send(b"x").await.unwrap_err();
        assert!(matches!(err, HubError::DeviceNotConnected));
        assert_eq!(err.to_string(), "device not connected");
    }

    #[tokio::test]
    async fn test_handlers_take_precedence_over_slot() {
        let core = core();
        let recorder = Arc::new(Recorder::default());
        let id = core.add_action_handler(recorder.clone()).await;

        let guard = core.begin_action("a-1", ActionType::GetTests).await;
        core.dispatch_response(Response::new(ActionType::GetTests, true)).await;
        assert_eq!(*recorder.seen.lock().await, vec![Some(ActionType::GetTests)]);

        core.remove_action_handler(id).await;
        core.dispatch_response(Response::new(ActionType::GetTests, true)).await;
        let response = guard.next_response().await.unwrap();
        assert_eq!(response.action_type, ActionType::GetTests);
        assert_eq!(recorder.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_action_id_is_not_delivered() {
        let core = core();
        let guard = core.begin_action("a-2", ActionType::GetScreenshot).await;

        let mut stale = Response::new(ActionType::GetScreenshot, true);
        stale.action_id = "a-1".to_string();
        core.dispatch_response(stale).await;

        let mut fresh = Response::new(ActionType::GetScreenshot, true);
        fresh.action_id = "a-2".to_string();
        core.dispatch_response(fresh).await;

        let response = guard.next_response().await.unwrap();
        assert_eq!(response.action_id, "a-2");
    }

    #[tokio::test]
    async fn test_disconnect_releases_waiter_and_handlers() {
        let core = core();
        let recorder = Arc::new(Recorder::default());
        core.add_action_handler(recorder.clone()).await;

        let guard = core.begin_action("a-1", ActionType::ExecuteTest).await;
        core.dispatch_disconnect().await;

        assert!(guard.next_response().await.is_none());
        assert_eq!(*recorder.seen.lock().await, vec![None]);
    }

    #[tokio::test]
    async fn test_log_report_does_not_fill_slot() {
        let core = core();
        let guard = core.begin_action("a-1", ActionType::GetScreenshot).await;

        let mut log = Response::new(ActionType::Log, true);
        log.payload.log_data = Some(devicehub_protocol::action::LogData {
            log_type: devicehub_protocol::action::LogType::DeviceLog,
            level: devicehub_protocol::action::LogLevel::Info,
            message: "loaded".to_string(),
        });
        core.dispatch_response(log).await;

        let waited = tokio::time::timeout(Duration::from_millis(50), guard.next_response()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_replaced_connection_keeps_new_one() {
        let core = core();
        let (_a, hub_a) = tokio::io::duplex(64);
        let (_b, hub_b) = tokio::io::duplex(64);
        let params = Connect {
            device_id: "dev-1".to_string(),
            ..Default::default()
        };
        let (old, _) = Connection::new(hub_a, params.clone(), "a", Duration::from_secs(60));
        let (new, _) = Connection::new(hub_b, params, "b", Duration::from_secs(60));

        assert!(core.set_connection(old.clone()).await.is_none());
        let replaced = core.set_connection(new.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&replaced, &old));

        core.connection_lost(&old).await;
        assert!(core.is_connected().await);
        assert!(Arc::ptr_eq(&core.connection().await.unwrap(), &new));

        core.connection_lost(&new).await;
        assert!(!core.is_connected().await);
    }

    #[tokio::test]
    async fn test_replaced_connection_does_not_release_caller() {
        let core = core();
        let (_a, hub_a) = tokio::io::duplex(64);
        let (_b, hub_b) = tokio::io::duplex(64);
        let params = Connect {
            device_id: "dev-1".to_string(),
            ..Default::default()
        };
        let (old, _) = Connection::new(hub_a, params.clone(), "a", Duration::from_secs(60));
        let (new, _) = Connection::new(hub_b, params, "b", Duration::from_secs(60));
        core.set_connection(old.clone()).await;
        core.set_connection(new).await;

        let guard = core.begin_action("a-1", ActionType::GetScreenshot).await;
        core.connection_lost(&old).await;
        let waited = tokio::time::timeout(Duration::from_millis(50), guard.next_response()).await;
        assert!(waited.is_err());

        let mut response = Response::new(ActionType::GetScreenshot, true);
        response.action_id = "a-1".to_string();
        core.dispatch_response(response).await;
        assert!(guard.next_response().await.unwrap().success);
    }
}
