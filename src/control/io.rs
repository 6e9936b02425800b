//! Control frame I/O.
//!
//! ```text
//! ┌────────────────┬──────────────────────┐
//! │ length (u32 BE)│ JSON body            │
//! └────────────────┴──────────────────────┘
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::ControlMessage;
use crate::error::{Result, ShmwireError};

/// Largest control frame body accepted.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// Serialize a control message into a complete frame.
pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_CONTROL_FRAME {
        return Err(ShmwireError::Protocol(format!(
            "control frame of {} bytes exceeds {}",
            body.len(),
            MAX_CONTROL_FRAME
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one control message and flush.
pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(msg)?;
    writer
        .write_all(&frame)
        .await
        .map_err(ShmwireError::from_io_kind)?;
    writer.flush().await.map_err(ShmwireError::from_io_kind)?;
    Ok(())
}

/// Read one control message.
///
/// # Errors
///
/// `PeerClosed` on end of stream; `Protocol` for an oversized frame.
pub async fn read_message<R>(reader: &mut R) -> Result<ControlMessage>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(ShmwireError::from_io_kind)?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_CONTROL_FRAME {
        return Err(ShmwireError::Protocol(format!(
            "control frame of {} bytes exceeds {}",
            len, MAX_CONTROL_FRAME
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(ShmwireError::from_io_kind)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &ControlMessage::JoinChannel { session_id: 9, index: 1 })
            .await
            .unwrap();
        write_message(&mut a, &ControlMessage::Close).await.unwrap();

        assert_eq!(
            read_message(&mut b).await.unwrap(),
            ControlMessage::JoinChannel { session_id: 9, index: 1 }
        );
        assert_eq!(read_message(&mut b).await.unwrap(), ControlMessage::Close);
    }

    #[tokio::test]
    async fn test_eof_is_peer_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_message(&mut b).await, Err(ShmwireError::PeerClosed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_CONTROL_FRAME as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(read_message(&mut b).await, Err(ShmwireError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_garbage_body_is_json_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 3, b'{', b'{', b'{']).await.unwrap();
        assert!(matches!(read_message(&mut b).await, Err(ShmwireError::Json(_))));
    }
}
