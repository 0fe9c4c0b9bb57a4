//! Length-prefixed frame codec for the bridge socket.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes
//! of UTF-8 JSON. Any codec error is fatal for the session that hit it.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::Frame;

/// Upper bound on a single frame body. Oversized lengths are rejected
/// before any allocation happens.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Errors produced while reading or writing frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame length {len} exceeds limit of {MAX_FRAME_LEN} bytes")]
    Oversized { len: usize },
}

/// Read one frame body. Short reads surface as `Io` (unexpected EOF).
///
/// Returns the raw JSON bytes; callers that need tolerance for unknown
/// frame types parse in two steps (see the session read loop).
pub async fn read_raw<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::Oversized { len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read and decode one frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let body = read_raw(reader).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Serialize and write one frame, header and body in a single write.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::Oversized { len: body.len() });
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ChatResponseFrame;

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frame = Frame::ChatResponse(ChatResponseFrame {
            request_id: "req-1".to_string(),
            delta: "hello".to_string(),
            done: false,
        });
        write_frame(&mut client, &frame).await.unwrap();

        let read = read_frame(&mut server).await.unwrap();
        match read {
            Frame::ChatResponse(resp) => {
                assert_eq!(resp.request_id, "req-1");
                assert_eq!(resp.delta, "hello");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_without_reading_body() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let len = (MAX_FRAME_LEN as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::Oversized { .. }));
    }

    #[tokio::test]
    async fn test_short_read_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Announce 100 bytes, deliver 3, then hang up.
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }

    #[tokio::test]
    async fn test_garbage_body_is_json_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let body = b"not json at all";
        client
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(body).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
