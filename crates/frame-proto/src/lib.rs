//! Wire framing and typed wire records shared between `frame-orchestrator` and
//! `frame-worker`.
//!
//! Two independent things live here: a length-prefixed framing format for the
//! control-plane TCP channel (registration / heartbeat / deregister / admin
//! requests), and the Frame Envelope codec — the single quarantine zone that
//! turns the flat key/value shape of a log entry into a typed [`FrameEnvelope`].

mod envelope;
mod reason;

pub use envelope::{EnvelopeError, FrameEnvelope, PayloadRef, WireFields};
pub use reason::{DlqReason, RoutingReason};

use serde::{Deserialize, Serialize};
use thiserror::Error;
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: [u8; 4] = *b"FORC";

/// Control-plane frame header. `kind` selects the operation; the body carries
/// a JSON payload specific to that kind (registration details, a heartbeat
/// sample, or an admin request).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame magic")]
    InvalidMagic,
    #[error("header too large: {0} bytes")]
    HeaderTooLarge(u32),
    #[error("body too large: {0} bytes")]
    BodyTooLarge(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header encode error: {0}")]
    HeaderEncode(String),
    #[error("header decode error: {0}")]
    HeaderDecode(String),
}

pub fn encode_header_json(header: &Header) -> Result<Vec<u8>, ProtoError> {
    serde_json::to_vec(header)
        .map_err(|err| ProtoError::HeaderEncode(err.to_string()))
}

pub fn decode_header_json(bytes: &[u8]) -> Result<Header, ProtoError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProtoError::HeaderDecode(err.to_string()))
}

#[cfg(feature = "tokio")]
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &[u8],
    body: &[u8],
) -> Result<(), ProtoError> {
    let header_len = u32::try_from(header.len())
        .map_err(|_| ProtoError::HeaderTooLarge(u32::MAX))?;
    let body_len = u64::try_from(body.len())
        .map_err(|_| ProtoError::BodyTooLarge(u64::MAX))?;

    writer.write_all(&MAGIC).await?;
    writer.write_all(&header_len.to_be_bytes()).await?;
    writer.write_all(&body_len.to_be_bytes()).await?;
    writer.write_all(header).await?;
    writer.write_all(body).await?;
    Ok(())
}

#[cfg(feature = "tokio")]
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_header_len: u32,
    max_body_len: u64,
) -> Result<(Vec<u8>, Vec<u8>), ProtoError> {
    let mut magic = [0_u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(ProtoError::InvalidMagic);
    }

    let mut header_len_buf = [0_u8; 4];
    reader.read_exact(&mut header_len_buf).await?;
    let header_len = u32::from_be_bytes(header_len_buf);
    if header_len > max_header_len {
        return Err(ProtoError::HeaderTooLarge(header_len));
    }

    let mut body_len_buf = [0_u8; 8];
    reader.read_exact(&mut body_len_buf).await?;
    let body_len = u64::from_be_bytes(body_len_buf);
    if body_len > max_body_len {
        return Err(ProtoError::BodyTooLarge(body_len));
    }

    let mut header = vec![0_u8; header_len as usize];
    reader.read_exact(&mut header).await?;

    let mut body = vec![0_u8; body_len as usize];
    reader.read_exact(&mut body).await?;

    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_json_round_trips() {
        let header = Header {
            from: "p1".to_string(),
            to: "frame-orchestrator".to_string(),
            kind: Some("register".to_string()),
            source: None,
        };
        let bytes = encode_header_json(&header).unwrap();
        let decoded = decode_header_json(&bytes).unwrap();
        assert_eq!(decoded.from, "p1");
        assert_eq!(decoded.kind.as_deref(), Some("register"));
    }

    #[tokio::test]
    async fn frame_round_trips_async() {
        let mut buf = Vec::new();
        write_frame_async(&mut buf, b"header-bytes", b"body-bytes").await.unwrap();
        assert_eq!(&buf[0..4], &MAGIC);

        let (header, body) = read_frame_async(&mut buf.as_slice(), 1024, 1024).await.unwrap();
        assert_eq!(header, b"header-bytes");
        assert_eq!(body, b"body-bytes");
    }

    #[tokio::test]
    async fn read_frame_async_rejects_bad_magic() {
        let mut buf = vec![0_u8; 4 + 4 + 8];
        let err = read_frame_async(&mut buf.as_slice(), 1024, 1024).await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidMagic));
    }
}
