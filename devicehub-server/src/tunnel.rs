//! Websocket ↔ channel bridge for the RPC tunnel.
//!
//! Both ends of the tunnel speak in whole binary messages. The RPC client
//! (master) and service (node) only see `mpsc` channels of encoded frames;
//! this module pumps those channels into and out of a websocket.

use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const TUNNEL_CHANNEL_SIZE: usize = 64;

/// What an incoming websocket message means to the tunnel
pub enum Inbound {
    Frame(Vec<u8>),
    Ignore,
    Close,
}

/// Spawn the pumps; returns the sender for outgoing frames and the receiver
/// of incoming ones
///
/// The incoming receiver ends when the peer closes or the socket fails.
/// The writer stops once that happens or every outgoing sender is dropped.
pub fn bridge<Si, St, M, E>(
    mut sink: Si,
    mut stream: St,
    wrap: fn(Vec<u8>) -> M,
    classify: fn(M) -> Inbound,
) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>)
where
    Si: Sink<M> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
    M: Send + 'static,
    E: Display + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(TUNNEL_CHANNEL_SIZE);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(TUNNEL_CHANNEL_SIZE);
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(message) => match classify(message) {
                    Inbound::Frame(bytes) => {
                        if in_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Inbound::Ignore => {}
                    Inbound::Close => break,
                },
                Err(e) => {
                    warn!("Tunnel read failed: {}", e);
                    break;
                }
            }
        }
        debug!("Tunnel reader finished");
        let _ = closed_tx.send(());
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(wrap(frame)).await {
                        warn!("Tunnel write failed: {}", e);
                        break;
                    }
                }
                _ = &mut closed_rx => break,
            }
        }
        let _ = sink.close().await;
        debug!("Tunnel writer finished");
    });

    (out_tx, in_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;

    #[derive(Debug)]
    enum Msg {
        Binary(Vec<u8>),
        Text(String),
        Close,
    }

    fn classify(msg: Msg) -> Inbound {
        match msg {
            Msg::Binary(bytes) => Inbound::Frame(bytes),
            Msg::Text(_) => Inbound::Ignore,
            Msg::Close => Inbound::Close,
        }
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (sink, mut written) = fmpsc::unbounded::<Msg>();
        let (peer, stream) = fmpsc::unbounded::<Msg>();
        let (out, mut incoming) = bridge(sink, stream.map(Ok::<_, Infallible>), Msg::Binary, classify);

        out.send(b"request".to_vec()).await.unwrap();
        match written.next().await {
            Some(Msg::Binary(bytes)) => assert_eq!(bytes, b"request"),
            other => panic!("unexpected: {:?}", other),
        }

        peer.unbounded_send(Msg::Text("noise".to_string())).unwrap();
        peer.unbounded_send(Msg::Binary(b"response".to_vec())).unwrap();
        assert_eq!(incoming.recv().await.unwrap(), b"response");
    }

    #[tokio::test]
    async fn test_close_ends_incoming() {
        let (sink, _written) = fmpsc::unbounded::<Msg>();
        let (peer, stream) = fmpsc::unbounded::<Msg>();
        let (_out, mut incoming) = bridge(sink, stream.map(Ok::<_, Infallible>), Msg::Binary, classify);

        peer.unbounded_send(Msg::Close).unwrap();
        assert!(incoming.recv().await.is_none());
    }
}
