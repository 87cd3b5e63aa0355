use devicehub_protocol::action::Connect;
use devicehub_protocol::{read_frame, write_frame, WireError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{HubError, Result};

/// Inactivity window after which a silent agent counts as disconnected
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

const INBOUND_QUEUE_SIZE: usize = 100;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Message surfaced by the read loop
#[derive(Debug)]
pub enum Inbound {
    Message(Vec<u8>),
    /// Sentinel pushed once when the read loop ends
    Disconnected,
}

/// Live link to an on-device agent, created after a successful handshake
pub struct Connection {
    params: Connect,
    peer: String,
    read_timeout: Duration,
    connected_since: Instant,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    inbound_tx: Mutex<Option<mpsc::Sender<Inbound>>>,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    /// Wrap a stream whose handshake has already been read
    pub fn new<S>(
        stream: S,
        params: Connect,
        peer: impl Into<String>,
        read_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Inbound>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (closed_tx, _) = watch::channel(false);

        let connection = Arc::new(Self {
            params,
            peer: peer.into(),
            read_timeout,
            connected_since: Instant::now(),
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            closed_tx,
        });

        (connection, inbound_rx)
    }

    pub fn params(&self) -> &Connect {
        &self.params
    }

    pub fn device_id(&self) -> &str {
        &self.params.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.params.session_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_since.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Read frames until EOF, error, read deadline or [`close`](Self::close)
    ///
    /// Each frame is pushed onto the inbound queue. When the loop ends an
    /// [`Inbound::Disconnected`] marker is pushed and the connection is closed.
    pub async fn handle_messages(&self) {
        let Some(mut reader) = self.reader.lock().await.take() else {
            warn!("Read loop for {} already running", self.device_id());
            return;
        };
        let mut closed_rx = self.closed_tx.subscribe();

        loop {
            if *closed_rx.borrow() {
                break;
            }

            let frame = tokio::select! {
                result = tokio::time::timeout(self.read_timeout, read_frame(&mut reader)) => result,
                _ = closed_rx.changed() => break,
            };

            match frame {
                Ok(Ok(bytes)) => {
                    let tx = self.inbound_tx.lock().await.clone();
                    match tx {
                        Some(tx) if tx.send(Inbound::Message(bytes)).await.is_ok() => {}
                        _ => break,
                    }
                }
                Ok(Err(WireError::Closed)) => {
                    info!("Device disconnected: {}", self.device_id());
                    break;
                }
                Ok(Err(e)) => {
                    info!("Device disconnected: {}: {}", self.device_id(), e);
                    break;
                }
                Err(_) => {
                    info!(
                        "Device {} silent for {:?}, disconnecting",
                        self.device_id(),
                        self.read_timeout
                    );
                    break;
                }
            }
        }

        if let Some(tx) = self.inbound_tx.lock().await.clone() {
            let _ = tx.send(Inbound::Disconnected).await;
        }
        self.close().await;
        debug!("Read loop for {} finished", self.device_id());
    }

    /// Write one framed message
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(HubError::DeviceNotConnected);
        };

        if let Err(e) = write_frame(w, payload).await {
            warn!("Write to {} failed: {}", self.device_id(), e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop the socket and close the inbound queue
    ///
    /// Queued messages stay readable; the receiver sees the end of the
    /// queue once they are drained. Safe to call more than once.
    pub async fn close(&self) {
        self.closed_tx.send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.inbound_tx.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn params(device_id: &str) -> Connect {
        Connect {
            device_id: device_id.to_string(),
            session_id: "s-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_frames_are_queued_then_disconnect_marker() {
        let (agent, hub) = tokio::io::duplex(4096);
        let (conn, mut rx) = Connection::new(hub, params("dev-1"), "test", DEFAULT_READ_TIMEOUT);

        let reader = Arc::clone(&conn);
        let task = tokio::spawn(async move { reader.handle_messages().await });

        let mut agent = agent;
        write_frame(&mut agent, b"first").await.unwrap();
        write_frame(&mut agent, b"second").await.unwrap();
        drop(agent);

        assert!(matches!(rx.recv().await, Some(Inbound::Message(m)) if m == b"first"));
        assert!(matches!(rx.recv().await, Some(Inbound::Message(m)) if m == b"second"));
        assert!(matches!(rx.recv().await, Some(Inbound::Disconnected)));
        assert!(rx.recv().await.is_none());

        task.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_is_not_connected() {
        let (mut agent, hub) = tokio::io::duplex(4096);
        let (conn, _rx) = Connection::new(hub, params("dev-1"), "test", DEFAULT_READ_TIMEOUT);

        conn.send(b"ping").await.unwrap();
        let frame = read_frame(&mut agent).await.unwrap();
        assert_eq!(frame, b"ping");

        conn.close().await;
        assert!(matches!(
            conn.send(b"again").await,
            Err(HubError::DeviceNotConnected)
        ));

        // writer shut down, agent sees EOF
        let mut rest = Vec::new();
        agent.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_disconnects_silent_agent() {
        let (_agent, hub) = tokio::io::duplex(4096);
        let (conn, mut rx) =
            Connection::new(hub, params("dev-1"), "test", Duration::from_secs(5));

        let reader = Arc::clone(&conn);
        tokio::spawn(async move { reader.handle_messages().await });

        assert!(matches!(rx.recv().await, Some(Inbound::Disconnected)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_stops_read_loop() {
        let (_agent, hub) = tokio::io::duplex(4096);
        let (conn, mut rx) = Connection::new(hub, params("dev-1"), "test", DEFAULT_READ_TIMEOUT);

        let reader = Arc::clone(&conn);
        let task = tokio::spawn(async move { reader.handle_messages().await });

        conn.close().await;
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
