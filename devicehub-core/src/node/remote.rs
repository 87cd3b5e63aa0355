//! Node → master callbacks.
//!
//! Agents connect to the node that launched them, so their responses and
//! the node's device logs have to be pushed back to the master over HTTP.

use async_trait::async_trait;
use devicehub_protocol::action::PerformanceData;
use devicehub_protocol::callback::{NodeActionRequest, NodeLogRequest, NodeLogType};
use devicehub_protocol::Response;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::device::{ActionHandler, LogWriter};
use crate::error::{HubError, Result};
use crate::manager::DeviceManager;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the master's `/node/*` endpoints
pub struct MasterCallbacks {
    http: reqwest::Client,
    base_url: String,
    node: String,
    attached: Mutex<HashSet<String>>,
}

impl MasterCallbacks {
    /// `master` is `host:port` or a full `http://` URL
    pub fn new(master: &str, node: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()?;
        let base_url = if master.starts_with("http://") || master.starts_with("https://") {
            master.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", master.trim_end_matches('/'))
        };
        Ok(Self {
            http,
            base_url,
            node: node.into(),
            attached: Mutex::new(HashSet::new()),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn post_action(&self, device_id: &str, response: Option<Response>) -> Result<()> {
        let body = NodeActionRequest {
            node: self.node.clone(),
            device_id: device_id.to_string(),
            response,
        };
        self.post("/node/action", &body).await
    }

    pub async fn post_log(&self, log: &NodeLogRequest) -> Result<()> {
        self.post("/node/log", log).await
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        if !response.status().is_success() {
            return Err(HubError::Transport(format!(
                "{} answered {}",
                path,
                response.status()
            )));
        }
        Ok(())
    }

    /// Relay responses and logs of every local device not yet relayed
    pub async fn attach(self: &Arc<Self>, devices: &DeviceManager) {
        let mut attached = self.attached.lock().await;
        for device in devices.devices().await {
            let id = device.device_id().to_string();
            if attached.contains(&id) {
                continue;
            }
            device
                .core()
                .add_action_handler(Arc::new(RemoteActionHandler::new(Arc::clone(self))))
                .await;
            device
                .core()
                .set_log_writer(Arc::new(RemoteLogWriter::new(Arc::clone(self), &id)))
                .await;
            debug!("Relaying {} to master", id);
            attached.insert(id);
        }
    }
}

/// Posts every agent response to `/node/action`; `None` becomes a null
/// response, which the master reads as a disconnect
pub struct RemoteActionHandler {
    callbacks: Arc<MasterCallbacks>,
}

impl RemoteActionHandler {
    pub fn new(callbacks: Arc<MasterCallbacks>) -> Self {
        Self { callbacks }
    }
}

#[async_trait]
impl ActionHandler for RemoteActionHandler {
    async fn on_action_response(&self, device_id: &str, response: Option<&Response>) {
        if let Err(e) = self.callbacks.post_action(device_id, response.cloned()).await {
            warn!("Relaying response of {} failed: {}", device_id, e);
        }
    }
}

/// Forwards device log output to `/node/log`
pub struct RemoteLogWriter {
    callbacks: Arc<MasterCallbacks>,
    device_id: String,
}

impl RemoteLogWriter {
    pub fn new(callbacks: Arc<MasterCallbacks>, device_id: &str) -> Self {
        Self {
            callbacks,
            device_id: device_id.to_string(),
        }
    }

    fn entry(&self, log_type: NodeLogType, source: &str) -> NodeLogRequest {
        NodeLogRequest::new(self.callbacks.node(), &self.device_id, log_type, source)
    }

    fn submit(&self, log: NodeLogRequest) {
        // log calls come from sync contexts; outside a runtime there is
        // nothing to post with
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let callbacks = Arc::clone(&self.callbacks);
                handle.spawn(async move {
                    if let Err(e) = callbacks.post_log(&log).await {
                        debug!("Dropping log of {}: {}", log.device_id, e);
                    }
                });
            }
            Err(_) => info!("[{}] {}: {}", self.device_id, log.source, log.message),
        }
    }
}

impl LogWriter for RemoteLogWriter {
    fn log(&self, source: &str, message: &str) {
        let mut log = self.entry(NodeLogType::Log, source);
        log.message = message.to_string();
        self.submit(log);
    }

    fn error(&self, source: &str, message: &str) {
        error!("[{}] {}: {}", self.device_id, source, message);
        let mut log = self.entry(NodeLogType::Error, source);
        log.message = message.to_string();
        self.submit(log);
    }

    fn data(&self, source: &str, path: &str) {
        let mut log = self.entry(NodeLogType::Data, source);
        log.message = path.to_string();
        self.submit(log);
    }

    fn performance(&self, perf: &PerformanceData, other: &str) {
        let mut log = self.entry(NodeLogType::Performance, "performance");
        log.checkpoint = perf.checkpoint.clone();
        log.cpu = perf.cpu;
        log.fps = perf.fps;
        log.mem = perf.memory;
        log.vertex_count = perf.vertex_count;
        log.triangles = perf.triangles;
        log.other = other.to_string();
        self.submit(log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicehub_protocol::ActionType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Minimal HTTP endpoint: answers 200 and reports `(path, body)`
    async fn spawn_master() -> (String, mpsc::Receiver<(String, serde_json::Value)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf).to_string();
                        let Some(split) = text.find("\r\n\r\n") else {
                            continue;
                        };
                        let head = &text[..split];
                        let length = head
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if buf.len() < split + 4 + length {
                            continue;
                        }
                        let path = head.split_whitespace().nth(1).unwrap().to_string();
                        let body: serde_json::Value =
                            serde_json::from_slice(&buf[split + 4..split + 4 + length]).unwrap();
                        stream
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                            .await
                            .unwrap();
                        let _ = tx.send((path, body)).await;
                        return;
                    }
                });
            }
        });
        (addr, rx)
    }

    #[test]
    fn test_base_url_forms() {
        let plain = MasterCallbacks::new("10.0.0.1:8002", "node-a").unwrap();
        assert_eq!(plain.url("/node/log"), "http://10.0.0.1:8002/node/log");

        let full = MasterCallbacks::new("https://hub.example.com/", "node-a").unwrap();
        assert_eq!(full.url("/node/action"), "https://hub.example.com/node/action");
    }

    #[tokio::test]
    async fn test_response_and_disconnect_relayed() {
        let (addr, mut rx) = spawn_master().await;
        let callbacks = Arc::new(MasterCallbacks::new(&addr, "node-a").unwrap());
        let handler = RemoteActionHandler::new(Arc::clone(&callbacks));

        let mut response = Response::new(ActionType::GetScreenshot, true);
        response.action_id = "a-1".to_string();
        handler.on_action_response("dev-1", Some(&response)).await;

        let (path, body) = rx.recv().await.unwrap();
        assert_eq!(path, "/node/action");
        assert_eq!(body["node"], "node-a");
        assert_eq!(body["device_id"], "dev-1");
        assert_eq!(body["response"]["actionID"], "a-1");

        handler.on_action_response("dev-1", None).await;
        let (_, body) = rx.recv().await.unwrap();
        assert!(body["response"].is_null());
    }

    #[tokio::test]
    async fn test_log_writer_posts_entries() {
        let (addr, mut rx) = spawn_master().await;
        let callbacks = Arc::new(MasterCallbacks::new(&addr, "node-a").unwrap());
        let writer = RemoteLogWriter::new(callbacks, "dev-1");

        writer.error("device", "adb went away");
        let (path, body) = rx.recv().await.unwrap();
        assert_eq!(path, "/node/log");
        assert_eq!(body["type"], 3);
        assert_eq!(body["source"], "device");
        assert_eq!(body["message"], "adb went away");
    }
}
