//! Handshake codec.
//!
//! A transfer stream is one metadata record followed by the raw payload:
//!
//! ```text
//! +----------------+---------------------------+------------------------+
//! | len: u32 (BE)  | JSON TransferMetadata     | payload bytes ... EOF  |
//! +----------------+---------------------------+------------------------+
//! ```
//!
//! The payload carries no framing of its own; the sender shutting down its
//! write half marks the end of it. Unknown JSON fields in the record are
//! ignored, so fields can be added without breaking older receivers.

use crate::TransferMetadata;
use crate::error::{Result, TransferError};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::MAX_METADATA_SIZE;

/// Encode metadata as a length-prefixed record.
pub fn encode_metadata(metadata: &TransferMetadata) -> Result<Vec<u8>> {
    if metadata.name.trim().is_empty() {
        return Err(TransferError::MalformedHandshake(
            "metadata name is empty".to_string(),
        ));
    }

    let json = serde_json::to_vec(metadata)
        .map_err(|e| TransferError::MalformedHandshake(e.to_string()))?;
    if json.len() > MAX_METADATA_SIZE {
        return Err(TransferError::MalformedHandshake(format!(
            "Message too large: {} bytes (max {})",
            json.len(),
            MAX_METADATA_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Write the metadata record to a stream.
pub async fn send_metadata<W>(send: &mut W, metadata: &TransferMetadata) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_metadata(metadata)?;
    send.write_all(&frame).await?;
    Ok(())
}

/// Read exactly one metadata record, leaving the payload unread.
pub async fn decode_metadata<R>(recv: &mut R) -> Result<TransferMetadata>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(recv, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(TransferError::MalformedHandshake(
            "empty metadata record".to_string(),
        ));
    }
    if len > MAX_METADATA_SIZE {
        return Err(TransferError::MalformedHandshake(format!(
            "Message too large: {} bytes (max {})",
            len, MAX_METADATA_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    read_exact_or_closed(recv, &mut buf).await?;
    parse_metadata(&buf)
}

/// Parse a record body (the bytes after the length prefix).
pub fn parse_metadata(body: &[u8]) -> Result<TransferMetadata> {
    let metadata: TransferMetadata = serde_json::from_slice(body)
        .map_err(|e| TransferError::MalformedHandshake(e.to_string()))?;
    if metadata.name.trim().is_empty() {
        return Err(TransferError::MalformedHandshake(
            "metadata name is empty".to_string(),
        ));
    }
    Ok(metadata)
}

async fn read_exact_or_closed<R>(recv: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match recv.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransferError::TransportClosed),
        Err(e) => Err(e.into()),
    }
}
