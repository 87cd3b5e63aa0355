use async_trait::async_trait;
use devicehub_protocol::{RpcFrame, RpcMethod, RpcRequest, RpcResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{HubError, Result};

/// Calls into one remote node
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn call(&self, method: RpcMethod, params: Value) -> Result<Value>;

    /// The transport is gone; every further call fails
    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Typed wrapper around [`NodeClient::call`]
pub async fn invoke<P, R>(client: &dyn NodeClient, method: RpcMethod, params: &P) -> Result<R>
where
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let params = serde_json::to_value(params)?;
    let result = client.call(method, params).await?;
    Ok(serde_json::from_value(result)?)
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// RPC client over a pair of frame channels (one encoded `RpcFrame` per
/// message), typically backed by the node's websocket
pub struct RpcClient {
    node: String,
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: PendingMap,
    next_id: AtomicU64,
    call_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl RpcClient {
    /// Start routing responses from `incoming`; the client closes when
    /// `incoming` ends
    pub fn new(
        node: impl Into<String>,
        outgoing: mpsc::Sender<Vec<u8>>,
        mut incoming: mpsc::Receiver<Vec<u8>>,
        call_timeout: Duration,
    ) -> Arc<Self> {
        let node = node.into();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let router_pending = Arc::clone(&pending);
        let router_closed = Arc::clone(&closed);
        let router_node = node.clone();
        tokio::spawn(async move {
            while let Some(bytes) = incoming.recv().await {
                match RpcFrame::decode(&bytes) {
                    Ok(RpcFrame::Response(response)) => {
                        let waiter = lock(&router_pending).remove(&response.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!(
                                "Late RPC response {} from {}",
                                response.id, router_node
                            ),
                        }
                    }
                    Ok(RpcFrame::Request(request)) => {
                        warn!(
                            "Ignoring {} request from node {}",
                            request.method.as_str(),
                            router_node
                        );
                    }
                    Err(e) => warn!("Undecodable RPC frame from {}: {}", router_node, e),
                }
            }
            router_closed.store(true, Ordering::SeqCst);
            // dropping the senders wakes every waiting caller
            lock(&router_pending).clear();
            debug!("RPC transport to {} closed", router_node);
        });

        Arc::new(Self {
            node,
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            call_timeout,
            closed,
        })
    }

    fn not_connected(&self) -> HubError {
        HubError::NodeNotConnected(self.node.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl NodeClient for RpcClient {
    async fn call(&self, method: RpcMethod, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(self.not_connected());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RpcFrame::Request(RpcRequest { id, method, params }).encode()?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if self.outgoing.send(frame).await.is_err() {
            lock(&self.pending).remove(&id);
            self.closed.store(true, Ordering::SeqCst);
            return Err(self.not_connected());
        }

        let response = match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(self.not_connected()),
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(HubError::Transport(format!(
                    "{} on {} timed out after {:?}",
                    method.as_str(),
                    self.node,
                    self.call_timeout
                )));
            }
        };

        if response.is_error() {
            return Err(HubError::from_rpc(
                response.error_code,
                response.error_message,
                None,
            ));
        }
        Ok(response.result)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outgoing.is_closed()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.pending).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicehub_protocol::rpc::{error_code, BoolResponse, FeatureRequest};

    /// Answers every request through `answer` on the far side of the channels
    fn spawn_node<F>(answer: F) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>)
    where
        F: Fn(RpcRequest) -> Option<RpcResponse> + Send + 'static,
    {
        let (to_node_tx, mut to_node_rx) = mpsc::channel::<Vec<u8>>(16);
        let (from_node_tx, from_node_rx) = mpsc::channel::<Vec<u8>>(16);
        tokio::spawn(async move {
            while let Some(bytes) = to_node_rx.recv().await {
                if let Ok(RpcFrame::Request(request)) = RpcFrame::decode(&bytes) {
                    if let Some(response) = answer(request) {
                        let frame = RpcFrame::Response(response).encode().unwrap();
                        if from_node_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        (to_node_tx, from_node_rx)
    }

    #[tokio::test]
    async fn test_typed_call() {
        let (tx, rx) = spawn_node(|req| {
            assert_eq!(req.method, RpcMethod::HasFeature);
            assert_eq!(req.params["feature"], "back");
            Some(RpcResponse::ok(req.id, serde_json::json!({"value": true})))
        });
        let client = RpcClient::new("node-a", tx, rx, Duration::from_secs(5));

        let response: BoolResponse = invoke(
            client.as_ref(),
            RpcMethod::HasFeature,
            &FeatureRequest {
                device_id: "dev-1".to_string(),
                feature: "back".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(response.value);
    }

    #[tokio::test]
    async fn test_error_code_becomes_error() {
        let (tx, rx) = spawn_node(|req| {
            Some(RpcResponse::error(req.id, error_code::FAILED, "adb exploded"))
        });
        let client = RpcClient::new("node-a", tx, rx, Duration::from_secs(5));

        match client.call(RpcMethod::StopApp, Value::Null).await {
            Err(HubError::Rpc { code, message }) => {
                assert_eq!(code, error_code::FAILED);
                assert_eq!(message, "adb exploded");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_transport_is_not_connected() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(16);
        let (from_node_tx, from_node_rx) = mpsc::channel::<Vec<u8>>(16);
        let client = RpcClient::new("node-a", tx, from_node_rx, Duration::from_secs(5));

        drop(rx);
        drop(from_node_tx);

        assert!(matches!(
            client.call(RpcMethod::Ping, Value::Null).await,
            Err(HubError::NodeNotConnected(_))
        ));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_transport_drop_wakes_waiting_call() {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
        let (from_node_tx, from_node_rx) = mpsc::channel::<Vec<u8>>(16);
        let client = RpcClient::new("node-a", tx, from_node_rx, Duration::from_secs(60));

        tokio::spawn(async move {
            // swallow the request, then the node goes away
            let _ = rx.recv().await;
            drop(from_node_tx);
        });

        assert!(matches!(
            client.call(RpcMethod::Ping, Value::Null).await,
            Err(HubError::NodeNotConnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let (tx, rx) = spawn_node(|_| None);
        let client = RpcClient::new("node-a", tx, rx, Duration::from_secs(60));

        assert!(matches!(
            client.call(RpcMethod::GetDevices, Value::Null).await,
            Err(HubError::Transport(_))
        ));
        assert!(!client.is_closed());
    }
}
