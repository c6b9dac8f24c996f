//! Length-prefixed framing of envelopes over a byte stream.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON envelope of len]
//! ```

use super::envelope::Envelope;
use crate::config::ProtocolConfig;
use crate::{CapwireError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(CapwireError::protocol(format!(
            "message size {} exceeds maximum {}",
            len,
            ProtocolConfig::MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(CapwireError::protocol(format!(
            "message size {} exceeds maximum {}",
            payload.len(),
            ProtocolConfig::MAX_MESSAGE_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode one frame's bytes into an envelope.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(frame)
        .map_err(|e| CapwireError::protocol(format!("malformed envelope: {}", e)))
}

/// Read and decode one envelope. `None` on clean EOF.
pub async fn read_envelope<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    match read_frame(reader).await? {
        Some(frame) => decode_envelope(&frame).map(Some),
        None => Ok(None),
    }
}

/// Serialize and write one envelope.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    let bytes = serde_json::to_vec(envelope)?;
    write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::Channel;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ProtocolConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_envelope_over_frames() {
        let envelope = Envelope::subscribe("realtime-api", "viewChanged").unwrap();
        let mut buf = Vec::new();
        write_envelope(&mut buf, &envelope).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_envelope(&mut cursor).await.unwrap().unwrap();

        assert_eq!(decoded.channel().unwrap(), Channel::Sub);
        assert_eq!(decoded, envelope);
        assert!(read_envelope(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        let err = decode_envelope(b"not valid json").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ProtocolError);
    }
}
