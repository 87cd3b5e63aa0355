//! Sessions bind a caller to exactly one locked device.

use devicehub_protocol::AppParameter;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Timeouts;
use crate::device::{Device, DeviceProperties};
use crate::error::{HubError, Result};
use crate::manager::DeviceManager;

/// Polling period of [`wait_for_connection`]
pub const CONNECTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wait until the app on `device` has connected its agent, bounded by the
/// device's connection timeout
pub async fn wait_for_connection(device: &Arc<dyn Device>) -> Result<()> {
    let deadline = Instant::now() + device.connection_timeout().await;
    loop {
        if device.is_app_connected().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(HubError::ConnectionTimeout);
        }
        tokio::time::sleep(CONNECTION_POLL_INTERVAL).await;
    }
}

pub struct Session {
    id: String,
    device: Arc<dyn Device>,
    app: Mutex<Option<AppParameter>>,
    recording: AtomicBool,
    last_access: std::sync::Mutex<Instant>,
}

impl Session {
    fn new(id: String, device: Arc<dyn Device>) -> Self {
        Self {
            id,
            device,
            app: Mutex::new(None),
            recording: AtomicBool::new(false),
            last_access: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub async fn app(&self) -> Option<AppParameter> {
        self.app.lock().await.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self
            .last_access
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}

/// Holds a session id while its device is being locked; released on drop
struct Reservation<'a> {
    reserved: &'a std::sync::Mutex<HashSet<String>>,
    session_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.session_id);
    }
}

pub struct SessionManager {
    devices: Arc<DeviceManager>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Session ids with a `lock_device` in flight
    reserved: std::sync::Mutex<HashSet<String>>,
    idle_timeout: Duration,
    sweep_period: Duration,
    /// Where apps started for a session connect their agent
    node_url: String,
    recording_dir: PathBuf,
}

impl SessionManager {
    pub fn new(
        devices: Arc<DeviceManager>,
        timeouts: &Timeouts,
        node_url: impl Into<String>,
        recording_dir: PathBuf,
    ) -> Self {
        Self {
            devices,
            sessions: RwLock::new(HashMap::new()),
            reserved: std::sync::Mutex::new(HashSet::new()),
            idle_timeout: timeouts.session_idle(),
            sweep_period: timeouts.session_sweep(),
            node_url: node_url.into(),
            recording_dir,
        }
    }

    /// Lock a device for `session_id`
    ///
    /// An explicit device id is locked directly and fails with
    /// `DeviceAlreadyLocked` when taken; otherwise the first free matching
    /// device is used. A session id that is live or being locked right now
    /// fails with `SessionExists`.
    pub async fn lock_device(
        &self,
        session_id: &str,
        properties: &DeviceProperties,
    ) -> Result<Arc<Session>> {
        let reservation = self.reserve(session_id).await?;

        let device = match properties.device_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => self.devices.get_device(id).await?.0,
            None => self.devices.find_device(properties).await?,
        };
        device.core().lock().await?;

        let session = Arc::new(Session::new(session_id.to_string(), Arc::clone(&device)));
        self.devices.bind_session(session_id, device.device_id()).await;
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.to_string(), Arc::clone(&session));
            drop(reservation);
        }

        debug!("LockDevice {} for session {}", device.device_id(), session_id);
        Ok(session)
    }

    async fn reserve(&self, session_id: &str) -> Result<Reservation<'_>> {
        let sessions = self.sessions.write().await;
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sessions.contains_key(session_id) || !reserved.insert(session_id.to_string()) {
            return Err(HubError::SessionExists(session_id.to_string()));
        }
        Ok(Reservation {
            reserved: &self.reserved,
            session_id: session_id.to_string(),
        })
    }

    /// Look up a session and mark it as used
    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| HubError::UnknownSession(session_id.to_string()))?;
        session.touch();
        Ok(session)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// End the session and release its device
    pub async fn unlock_device(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| HubError::UnknownSession(session_id.to_string()))?;
        self.teardown(&session).await
    }

    /// Install if needed, launch the app and wait for its agent to connect
    pub async fn start_app(&self, session_id: &str, app: AppParameter) -> Result<()> {
        let session = self.get(session_id).await?;
        let device = session.device();

        if !device.is_app_installed(&app).await? {
            info!("Installing {} on {}", app.identifier, device.device_id());
            device.install_app(&app).await?;
        }
        device.start_app(&app, session_id, &self.node_url).await?;
        *session.app.lock().await = Some(app);

        wait_for_connection(device).await?;
        session.touch();
        Ok(())
    }

    pub async fn start_recording(&self, session_id: &str) -> Result<PathBuf> {
        let session = self.get(session_id).await?;
        let path = self.recording_dir.join(format!("{}.mp4", session_id));
        session
            .device()
            .start_recording(&path.to_string_lossy())
            .await?;
        session.recording.store(true, Ordering::SeqCst);
        Ok(path)
    }

    pub async fn stop_recording(&self, session_id: &str) -> Result<()> {
        let session = self.get(session_id).await?;
        if session.recording.swap(false, Ordering::SeqCst) {
            session.device().stop_recording().await?;
        }
        Ok(())
    }

    /// Stop recorder and app, unlock, then stop the device
    async fn teardown(&self, session: &Session) -> Result<()> {
        let device = session.device();
        debug!("UnlockDevice {} from session {}", device.device_id(), session.id());

        if session.recording.swap(false, Ordering::SeqCst) {
            if let Err(e) = device.stop_recording().await {
                warn!("Stop recording on {} failed: {}", device.device_id(), e);
            }
        }
        if let Some(app) = session.app.lock().await.take() {
            if let Err(e) = device.stop_app(&app).await {
                error!("Stop App failed: {}", e);
            }
        }

        self.devices.unbind_session(session.id()).await;
        let unlocked = device.core().unlock().await;

        if let Err(e) = self.devices.stop(device.device_id()).await {
            warn!("Stop of {} failed: {}", device.device_id(), e);
        }
        unlocked
    }

    /// Tear down sessions idle longer than the idle timeout
    pub async fn sweep(&self) {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() >= self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in expired {
            info!("Session {} idle, releasing {}", session.id(), session.device().device_id());
            if let Err(e) = self.teardown(&session).await {
                warn!("Teardown of session {} failed: {}", session.id(), e);
            }
        }
    }

    /// Sweep periodically until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Session sweep stopped");
    }
}
