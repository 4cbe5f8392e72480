//! Length-prefixed framing.
//!
//! The framer knows nothing about transports or routing. It turns messages
//! into `[u32 BE len][payload]` byte sequences and back, refusing any frame
//! whose declared length exceeds the configured maximum before allocating
//! for it.

use crate::config::ProtocolConfig;
use crate::error::{IpcError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encoder/decoder for the length-prefixed envelope.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    max_frame_size: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(ProtocolConfig::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Framer {
    /// Create a framer. The limit is clamped to the protocol ceiling.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(ProtocolConfig::MAX_FRAME_CEILING),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize `message` and prepend the length prefix.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Bytes> {
        let payload = serde_json::to_vec(message)?;
        self.encode_payload(&payload)
    }

    /// Prepend the length prefix to an already-serialized payload.
    pub fn encode_payload(&self, payload: &[u8]) -> Result<Bytes> {
        self.check_len(payload.len())?;
        let mut buf = BytesMut::with_capacity(ProtocolConfig::LENGTH_PREFIX_BYTES + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }

    /// Parse a frame payload as UTF-8 JSON.
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| IpcError::protocol("Invalid UTF-8 in frame payload"))?;
        serde_json::from_str(text)
            .map_err(|e| IpcError::protocol(format!("Malformed frame payload: {}", e)))
    }

    /// Read one frame payload.
    ///
    /// Returns `None` on clean EOF at a frame boundary. EOF anywhere inside a
    /// frame is a protocol error.
    pub async fn read_frame<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; ProtocolConfig::LENGTH_PREFIX_BYTES];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(IpcError::protocol("Stream closed inside length prefix"));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        self.check_len(len)?;

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload).await {
            Ok(_) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(IpcError::protocol(
                format!("Stream closed mid-frame (expected {} bytes)", len),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse one message. `None` on clean EOF.
    pub async fn read_message<T, R>(&self, reader: &mut R) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        R: AsyncRead + Unpin,
    {
        match self.read_frame(reader).await? {
            Some(payload) => self.decode(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Serialize and write one message, flushing afterwards.
    pub async fn write_message<T, W>(&self, writer: &mut W, message: &T) -> Result<()>
    where
        T: Serialize,
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.max_frame_size {
            return Err(IpcError::FrameTooLarge {
                declared: len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Method, Request, Response};
    use serde_json::json;

    #[tokio::test]
    async fn test_request_survives_framing() {
        let framer = Framer::default();
        let request = Request::post("/api/v1/connectors/abc/config", json!({"enabled": true}))
            .with_request_id("r1")
            .with_header("x-client", "ui");

        let frame = framer.encode(&request).unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4);

        let mut cursor = std::io::Cursor::new(frame.to_vec());
        let decoded: Request = framer.read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.method, Method::Post);
    }

    #[tokio::test]
    async fn test_consecutive_frames() {
        let framer = Framer::default();
        let mut buf = Vec::new();
        framer
            .write_message(&mut buf, &Response::ok(json!({"n": 1})))
            .await
            .unwrap();
        framer
            .write_message(&mut buf, &Response::ok(json!({"n": 2})))
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: Response = framer.read_message(&mut cursor).await.unwrap().unwrap();
        let second: Response = framer.read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first.data, Some(json!({"n": 1})));
        assert_eq!(second.data, Some(json!({"n": 2})));
        assert!(framer
            .read_message::<Response, _>(&mut cursor)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_returns_none() {
        let framer = Framer::default();
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(framer.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_declaration_rejected_without_payload() {
        let framer = Framer::new(1024);
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        match framer.read_frame(&mut cursor).await {
            Err(IpcError::FrameTooLarge { declared, max }) => {
                assert_eq!(declared, u32::MAX as usize);
                assert_eq!(max, 1024);
            }
            other => panic!("Expected FrameTooLarge, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_payload_is_protocol_error() {
        let framer = Framer::default();
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");

        let mut cursor = std::io::Cursor::new(buf);
        let err = framer.read_frame(&mut cursor).await.unwrap_err();
        assert!(err.is_protocol_error(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_truncated_prefix_is_protocol_error() {
        let framer = Framer::default();
        let mut cursor = std::io::Cursor::new(vec![0u8, 0u8]);
        let err = framer.read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, IpcError::Protocol { .. }));
    }

    #[test]
    fn test_decode_rejects_bad_utf8_and_json() {
        let framer = Framer::default();
        assert!(framer.decode::<Request>(&[0xff, 0xfe]).unwrap_err().is_protocol_error());
        assert!(framer.decode::<Request>(b"not json").unwrap_err().is_protocol_error());
    }

    #[test]
    fn test_encode_respects_limit() {
        let framer = Framer::new(16);
        let err = framer
            .encode(&Request::post("/api/v1/x", json!({"big": "x".repeat(64)})))
            .unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_limit_clamped_to_ceiling() {
        let framer = Framer::new(usize::MAX);
        assert_eq!(framer.max_frame_size(), ProtocolConfig::MAX_FRAME_CEILING);
    }
}
