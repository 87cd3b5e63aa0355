use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use devicehub_core::device::{DeviceHandler, StaticHandler};
use devicehub_core::node::{NodeHandler, NodeManager, RpcClient};
use devicehub_core::{DeviceManager, HubConfig, SessionManager};
use devicehub_protocol::action::PerformanceData;
use devicehub_protocol::callback::{NodeActionRequest, NodeLogRequest, NodeLogType};
use devicehub_protocol::rpc::RegisterNodeRequest;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::tunnel::{self, Inbound};

/// A node must register within this long after the upgrade
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct MasterState {
    pub devices: Arc<DeviceManager>,
    pub nodes: Arc<NodeManager>,
    pub rpc_timeout: Duration,
}

pub fn router(state: MasterState, app_dir: std::path::PathBuf) -> Router {
    Router::new()
        .route("/node/connect", get(node_connect))
        .route("/node/log", post(node_log))
        .route("/node/action", post(node_action))
        .nest_service("/upload", ServeDir::new(app_dir))
        .with_state(state)
}

/// Run the master until `shutdown` flips to true
pub async fn run(config: HubConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let timeouts = &config.timeouts;
    let devices = Arc::new(DeviceManager::new(timeouts));
    for (platform, manager) in config.enabled_managers() {
        devices
            .add_handler(Arc::new(StaticHandler::new(platform, manager)))
            .await;
    }

    let nodes = Arc::new(NodeManager::new(timeouts));
    let node_handler: Arc<dyn DeviceHandler> = NodeHandler::new(Arc::clone(&nodes));
    devices.add_handler(node_handler).await;

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&devices),
        timeouts,
        config.node_url.clone(),
        config.recording_dir(),
    ));

    let device_listener = TcpListener::bind(("0.0.0.0", config.device_port))
        .await
        .with_context(|| format!("Failed to bind device port {}", config.device_port))?;
    info!("Accepting device connections on port {}", config.device_port);

    let device_task = tokio::spawn(Arc::clone(&devices).run(device_listener, shutdown.clone()));
    tokio::spawn(Arc::clone(&nodes).run(shutdown.clone()));
    tokio::spawn(Arc::clone(&sessions).run(shutdown.clone()));

    let state = MasterState {
        devices,
        nodes,
        rpc_timeout: timeouts.rpc_call(),
    };
    let app = router(state, config.app_dir());

    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", config.http_port))?;
    info!("Master listening on port {}", config.http_port);

    let mut http_shutdown = shutdown.clone();
    axum::serve(
        http_listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = http_shutdown.wait_for(|stop| *stop).await;
    })
    .await?;

    let _ = device_task.await;
    info!("Master stopped");
    Ok(())
}

async fn node_connect(
    State(state): State<MasterState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_node_socket(socket, state, addr))
}

fn classify(message: Message) -> Inbound {
    match message {
        Message::Binary(bytes) => Inbound::Frame(bytes.to_vec()),
        Message::Close(_) => Inbound::Close,
        _ => Inbound::Ignore,
    }
}

/// First binary frame registers the node; every later frame is RPC
async fn handle_node_socket(socket: WebSocket, state: MasterState, addr: SocketAddr) {
    let (sink, mut stream) = socket.split();

    let registration = tokio::time::timeout(REGISTRATION_TIMEOUT, async {
        while let Some(Ok(message)) = stream.next().await {
            if let Inbound::Frame(bytes) = classify(message) {
                return Some(bytes);
            }
        }
        None
    })
    .await;

    let request = match registration {
        Ok(Some(bytes)) => match serde_json::from_slice::<RegisterNodeRequest>(&bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid registration from {}: {}", addr, e);
                return;
            }
        },
        Ok(None) => {
            debug!("Node at {} left before registering", addr);
            return;
        }
        Err(_) => {
            warn!("Node at {} did not register in time", addr);
            return;
        }
    };

    let (outgoing, incoming) = tunnel::bridge(
        sink,
        stream,
        |bytes| Message::Binary(bytes.into()),
        classify,
    );
    let client = RpcClient::new(
        request.identifier.clone(),
        outgoing,
        incoming,
        state.rpc_timeout,
    );
    state
        .nodes
        .register_node(request, addr.ip().to_string(), client)
        .await;
}

async fn node_log(
    State(state): State<MasterState>,
    Json(log): Json<NodeLogRequest>,
) -> StatusCode {
    let device = match state.devices.get_device(&log.device_id).await {
        Ok((device, _)) => device,
        Err(_) => {
            debug!(
                "[{}/{}] {}: {}",
                log.node, log.device_id, log.source, log.message
            );
            return StatusCode::NOT_FOUND;
        }
    };

    let writer = device.core().log_writer().await;
    match log.log_type {
        NodeLogType::Log => writer.log(&log.source, &log.message),
        NodeLogType::Error => writer.error(&log.source, &log.message),
        NodeLogType::Data => writer.data(&log.source, &log.message),
        NodeLogType::Performance => {
            let perf = PerformanceData {
                checkpoint: log.checkpoint.clone(),
                cpu: log.cpu,
                memory: log.mem,
                fps: log.fps,
                vertex_count: log.vertex_count,
                triangles: log.triangles,
            };
            writer.performance(&perf, &log.other);
        }
    }
    StatusCode::OK
}

/// Re-dispatch an agent response captured on a node into the proxy device
async fn node_action(
    State(state): State<MasterState>,
    Json(action): Json<NodeActionRequest>,
) -> StatusCode {
    let device = match state.devices.get_device(&action.device_id).await {
        Ok((device, _)) => device,
        Err(e) => {
            warn!("Action callback from {}: {}", action.node, e);
            return StatusCode::NOT_FOUND;
        }
    };

    match action.response {
        Some(response) => device.core().dispatch_response(response).await,
        None => {
            info!("Device {} on {} disconnected", action.device_id, action.node);
            device.core().dispatch_disconnect().await;
        }
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use devicehub_core::config::{DeviceConfig, ManagerConfig, Timeouts};
    use devicehub_core::device::Platform;
    use devicehub_protocol::{ActionType, Response};
    use tower::ServiceExt;

    async fn state() -> MasterState {
        let timeouts = Timeouts::default();
        let devices = Arc::new(DeviceManager::new(&timeouts));
        let config = ManagerConfig {
            enabled: true,
            commands: Default::default(),
            devices: vec![DeviceConfig {
                id: "chrome-1".to_string(),
                ..Default::default()
            }],
            connection_timeout_secs: None,
        };
        devices
            .add_handler(Arc::new(StaticHandler::new(Platform::Web, &config)))
            .await;
        MasterState {
            devices,
            nodes: Arc::new(NodeManager::new(&timeouts)),
            rpc_timeout: timeouts.rpc_call(),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_action_callback_releases_waiting_caller() {
        let state = state().await;
        let (device, _) = state.devices.get_device("chrome-1").await.unwrap();
        let app = router(state, std::env::temp_dir());

        let guard = device.core().begin_action("a-1", ActionType::ElementGetValue).await;

        let mut response = Response::new(ActionType::ElementGetValue, true);
        response.action_id = "a-1".to_string();
        let body = serde_json::json!({
            "node": "node-a",
            "deviceId": "chrome-1",
            "response": response,
        });
        let status = app
            .oneshot(post_json("/node/action", body))
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::OK);

        let received = guard.next_response().await.unwrap();
        assert!(received.success);
        assert_eq!(received.action_id, "a-1");
    }

    #[tokio::test]
    async fn test_null_action_is_disconnect() {
        let state = state().await;
        let (device, _) = state.devices.get_device("chrome-1").await.unwrap();
        let app = router(state, std::env::temp_dir());

        let guard = device.core().begin_action("a-2", ActionType::GetScreenshot).await;
        let body = serde_json::json!({"node": "node-a", "device_id": "chrome-1", "response": null});
        let status = app
            .oneshot(post_json("/node/action", body))
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::OK);
        assert!(guard.next_response().await.is_none());
    }

    #[tokio::test]
    async fn test_callbacks_for_unknown_device() {
        let app = router(state().await, std::env::temp_dir());

        let action = serde_json::json!({"node": "node-a", "deviceId": "ghost"});
        let status = app
            .clone()
            .oneshot(post_json("/node/action", action))
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let log = serde_json::json!({"node": "node-a", "deviceId": "ghost", "type": 2, "message": "hi"});
        let status = app
            .oneshot(post_json("/node/log", log))
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_log_callback_accepted() {
        let app = router(state().await, std::env::temp_dir());
        let log = serde_json::json!({
            "node": "node-a",
            "deviceId": "chrome-1",
            "source": "device",
            "type": 0,
            "checkpoint": "menu",
            "fps": 59.5,
        });
        let status = app
            .oneshot(post_json("/node/log", log))
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_upload_serves_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("game.apk"), b"binary").unwrap();
        let app = router(state().await, dir.path().to_path_buf());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/upload/game.apk")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"binary");
    }
}
