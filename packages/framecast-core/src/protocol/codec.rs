//! Length-prefixed JSON framing over async byte streams.
//!
//! The functions are generic over the tokio I/O traits so the session layer
//! uses them on split TCP halves and tests use in-memory duplex pipes.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::{FramecastError, FramecastResult};
use crate::protocol::Message;

/// Serializes a message into a length-prefixed frame.
pub fn encode_message(message: &Message) -> FramecastResult<Bytes> {
    let payload =
        serde_json::to_vec(message).map_err(|e| FramecastError::Encode(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FramecastError::Encode(format!(
            "message of {} bytes exceeds {} byte bound",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Encodes and writes one message, fully.
pub async fn send_message<W>(writer: &mut W, message: &Message) -> FramecastResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| FramecastError::Transport(format!("sending {}: {}", message.kind(), e)))?;
    writer
        .flush()
        .await
        .map_err(|e| FramecastError::Transport(e.to_string()))?;
    Ok(())
}

/// Reads one message.
///
/// Returns `None` on a clean close at a frame boundary (zero bytes where the
/// length prefix would start). A close anywhere else is a short read and
/// fails with `Decode`.
pub async fn recv_message<R>(reader: &mut R) -> FramecastResult<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FramecastError::Transport(e.to_string())),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FramecastError::Decode(format!(
            "frame length {} exceeds {} byte bound",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| FramecastError::Decode(format!("short frame: {}", e)))?;

    let message =
        serde_json::from_slice(&payload).map_err(|e| FramecastError::Decode(e.to_string()))?;
    Ok(Some(message))
}

/// Reads exactly `n` raw bytes. A short read is an error.
pub async fn recv_bytes<R>(reader: &mut R, n: usize) -> FramecastResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| FramecastError::Decode(format!("expected {} raw bytes: {}", n, e)))?;
    Ok(buf)
}

/// Writes raw bytes, fully.
pub async fn send_bytes<W>(writer: &mut W, data: &[u8]) -> FramecastResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(data)
        .await
        .map_err(|e| FramecastError::Transport(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| FramecastError::Transport(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VideoInfo;
    use tokio::io::duplex;

    fn sample_handshake() -> Message {
        Message::Handshake {
            version: 1,
            mode: "stream".into(),
            codec: "mp4v".into(),
            processing: "edges".into(),
            filters: vec![],
            video_info: VideoInfo {
                filename: "test.mp4".into(),
                size_bytes: 4096,
            },
        }
    }

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (mut a, mut b) = duplex(4096);
        let msg = sample_handshake();
        send_message(&mut a, &msg).await.unwrap();

        let received = recv_message(&mut b).await.unwrap();
        assert_eq!(received, Some(msg));
    }

    #[tokio::test]
    async fn clean_close_returns_none() {
        let (a, mut b) = duplex(64);
        drop(a);
        let received = recv_message(&mut b).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn close_mid_frame_is_decode_error() {
        let (mut a, mut b) = duplex(64);
        // Length prefix promises 100 bytes but only 3 arrive.
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let err = recv_message(&mut b).await.unwrap_err();
        assert!(matches!(err, FramecastError::Decode(_)));
    }

    #[tokio::test]
    async fn oversize_length_prefix_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();

        let err = recv_message(&mut b).await.unwrap_err();
        assert!(matches!(err, FramecastError::Decode(_)));
    }

    #[tokio::test]
    async fn bad_json_is_decode_error() {
        let (mut a, mut b) = duplex(64);
        let garbage = b"not json";
        a.write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        a.write_all(garbage).await.unwrap();

        let err = recv_message(&mut b).await.unwrap_err();
        assert!(matches!(err, FramecastError::Decode(_)));
    }

    #[tokio::test]
    async fn recv_bytes_exact_and_short() {
        let (mut a, mut b) = duplex(64);
        a.write_all(b"hello").await.unwrap();
        let got = recv_bytes(&mut b, 5).await.unwrap();
        assert_eq!(got, b"hello");

        a.write_all(b"hi").await.unwrap();
        drop(a);
        let err = recv_bytes(&mut b, 5).await.unwrap_err();
        assert!(matches!(err, FramecastError::Decode(_)));
    }
}
