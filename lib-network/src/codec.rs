//! Length-prefixed JSON framing.
//!
//! Each frame is a big-endian u32 byte length followed by a JSON document.
//! The length cap is enforced before any parsing so an abusive peer cannot
//! make the node buffer or parse an oversized message.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::NetError;

/// Maximum frame payload: 1 MiB.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read one frame, enforcing [`MAX_FRAME_LEN`] before allocating or parsing.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Value, NetError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 || len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    serde_json::from_slice(&payload).map_err(|e| NetError::BadJson(e.to_string()))
}

/// Serialize and write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    doc: &Value,
) -> Result<(), NetError> {
    let payload = serde_json::to_vec(doc).map_err(|e| NetError::BadJson(e.to_string()))?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(payload.len()));
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frame_round_trip() {
        let doc = json!({"msg_type": 1, "msg_cmd": 0, "hash": "abc"});
        let mut buf = Vec::new();
        write_frame(&mut buf, &doc).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(back, doc);
    }

    #[tokio::test]
    async fn oversized_frame_rejected_before_parse() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        // no payload needed: the length word alone must trip the check
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(NetError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn garbage_payload_is_bad_json() {
        let payload = b"not json at all";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(NetError::BadJson(_))
        ));
    }
}
