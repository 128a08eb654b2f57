//! Multi-part message framing on a byte stream.
//!
//! ```text
//! message  = frame_count:u32 frame*
//! frame    = len:u32 bytes
//! ```
//!
//! A connecting socket first writes its 16-byte identity, before any message.

use bytes::{BufMut, Bytes, BytesMut};
use occams_fabric_core::envelope::message_size;
use occams_fabric_core::error::TransportError;
use occams_fabric_core::id::TOKEN_LEN;
use occams_fabric_core::{Message, PeerToken, TcpConfig};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Encode `msg` into one buffer, checked against the limits of `config`.
pub fn encode_message(msg: &[Bytes], config: &TcpConfig) -> Result<Bytes, TransportError> {
    if msg.len() > config.max_frames as usize {
        return Err(TransportError::TooLarge(msg.len()));
    }
    let size = message_size(msg);
    if size > config.max_message_size {
        return Err(TransportError::TooLarge(size));
    }
    let mut buf = BytesMut::with_capacity(4 + msg.len() * 4 + size);
    buf.put_u32(msg.len() as u32);
    for frame in msg {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    Ok(buf.freeze())
}

/// Read one message. `None` on a clean end of stream between two messages.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R, config: &TcpConfig) -> io::Result<Option<Message>> {
    let count = match r.read_u32().await {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if count > config.max_frames {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("{} frames over limit {}", count, config.max_frames)));
    }
    let mut msg = Vec::with_capacity(count as usize);
    let mut total = 0usize;
    for _ in 0..count {
        let len = r.read_u32().await? as usize;
        total += len;
        if total > config.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message over size limit {}", config.max_message_size),
            ));
        }
        let mut frame = BytesMut::zeroed(len);
        r.read_exact(&mut frame).await?;
        msg.push(frame.freeze());
    }
    Ok(Some(msg))
}

pub async fn read_identity<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<PeerToken> {
    let mut buf = [0u8; TOKEN_LEN];
    r.read_exact(&mut buf).await?;
    Ok(PeerToken::from_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TcpConfig {
        TcpConfig { max_frames: 3, max_message_size: 8, ..Default::default() }
    }

    #[tokio::test]
    async fn test_read_back() {
        let msg = vec![Bytes::from_static(b"ab"), Bytes::new(), Bytes::from_static(b"cde")];
        let buf = encode_message(&msg, &config()).expect("encode");
        assert_eq!(buf.len(), 4 + 3 * 4 + 5);
        let mut twice = buf.to_vec();
        twice.extend_from_slice(&buf);
        let mut r = &twice[..];
        assert_eq!(read_message(&mut r, &config()).await.expect("read"), Some(msg.clone()));
        assert_eq!(read_message(&mut r, &config()).await.expect("read"), Some(msg));
        assert_eq!(read_message(&mut r, &config()).await.expect("eof"), None);
    }

    #[tokio::test]
    async fn test_limits() {
        let four = vec![Bytes::new(); 4];
        assert!(matches!(encode_message(&four, &config()), Err(TransportError::TooLarge(4))));
        let big = vec![Bytes::from_static(b"0123456789")];
        assert!(matches!(encode_message(&big, &config()), Err(TransportError::TooLarge(10))));

        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&100u32.to_be_bytes());
        let e = read_message(&mut &raw[..], &config()).await.unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);

        // truncated inside a frame is an error, not a clean end
        let buf = encode_message(&[Bytes::from_static(b"abc")], &config()).expect("encode");
        let e = read_message(&mut &buf[..buf.len() - 1], &config()).await.unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
    }
}
