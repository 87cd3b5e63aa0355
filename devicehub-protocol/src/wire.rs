use serde::{de::DeserializeOwned, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frames larger than this are rejected before the payload is read (100MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Errors raised by the framing layer
#[derive(Error, Debug)]
pub enum WireError {
    /// The peer closed the stream before a full frame arrived
    #[error("connection closed")]
    Closed,

    /// Length prefix exceeds [`MAX_FRAME_SIZE`]
    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    /// Underlying socket error (including read deadlines)
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Payload could not be encoded or decoded
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl WireError {
    fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(err)
        }
    }
}

/// Write one frame: 4-byte big-endian length prefix followed by the payload
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), WireError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one frame and return its payload
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(WireError::from_read)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(WireError::from_read)?;

    Ok(buf)
}

/// Send a JSON-encoded message as one frame
pub async fn send_message<T: Serialize, W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), WireError> {
    let json = serde_json::to_vec(msg)?;
    write_frame(writer, &json).await
}

/// Receive one frame and decode it as JSON
pub async fn recv_message<T: DeserializeOwned, R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<T, WireError> {
    let buf = read_frame(reader).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionType, Request};

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.unwrap();

        let mut raw = [0u8; 9];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[..4], &[0, 0, 0, 5]);
        assert_eq!(&raw[4..], b"hello");
    }

    #[tokio::test]
    async fn test_send_recv_action_request() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let request = Request::new(ActionType::GetScreenshot);
        send_message(&mut client, &request).await.unwrap();

        let received: Request = recv_message(&mut server).await.unwrap();
        assert_eq!(received.action_type, ActionType::GetScreenshot);
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let len = (MAX_FRAME_SIZE as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        match read_frame(&mut server).await {
            Err(WireError::TooLarge(n)) => assert_eq!(n, MAX_FRAME_SIZE + 1),
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_closed() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(matches!(read_frame(&mut server).await, Err(WireError::Closed)));
    }
}
