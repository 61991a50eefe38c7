//! Low-level frame accumulation over byte streams.
//!
//! Everything in this module works in terms of "exactly N bytes before a
//! deadline". A peer closing the connection mid-read is reported as
//! [`ReadError::Closed`], which is distinct from [`ReadError::Timeout`] so
//! callers can tell a dead peer from a slow one.
//!
//! The bare peer-stream framing also lives here: once a direct peer stream
//! is established, every frame on it is a length-prefixed payload with no
//! type byte. That asymmetry is part of the wire contract and is deliberately
//! not "fixed".

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

/// Largest payload a bare peer frame can carry, implied by its u16 length.
pub const MAX_FRAME_BYTES: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum ReadError {
    /// The deadline elapsed before all requested bytes arrived.
    #[error("read deadline elapsed")]
    Timeout,
    /// The peer closed the connection before all requested bytes arrived.
    #[error("connection closed by peer")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Reads exactly `buf.len()` bytes, accumulating partial reads, or fails.
///
/// The deadline bounds the whole accumulation, not each partial read. A
/// zero-byte read means the peer closed the connection and yields
/// [`ReadError::Closed`].
pub async fn read_exact<R>(reader: &mut R, buf: &mut [u8], deadline: Instant) -> Result<(), ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = match timeout_at(deadline, reader.read(&mut buf[filled..])).await {
            Ok(read) => read?,
            Err(_) => return Err(ReadError::Timeout),
        };
        if n == 0 {
            return Err(ReadError::Closed);
        }
        filled += n;
    }
    Ok(())
}

pub async fn read_u8<R>(reader: &mut R, deadline: Instant) -> Result<u8, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    read_exact(reader, &mut buf, deadline).await?;
    Ok(buf[0])
}

pub async fn read_u16<R>(reader: &mut R, deadline: Instant) -> Result<u16, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf, deadline).await?;
    Ok(u16::from_be_bytes(buf))
}

pub async fn read_u32<R>(reader: &mut R, deadline: Instant) -> Result<u32, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, deadline).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Reads one bare peer frame: u16 payload length, then the payload.
///
/// Returns `Ok(None)` when the peer closes the stream cleanly before the
/// length header; a close mid-frame is a [`ReadError::Closed`] error.
pub async fn read_frame<R>(reader: &mut R, deadline: Instant) -> Result<Option<Vec<u8>>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let high = match read_u8(reader, deadline).await {
        Ok(byte) => byte,
        Err(ReadError::Closed) => return Ok(None),
        Err(err) => return Err(err),
    };
    let low = read_u8(reader, deadline).await?;
    let len = u16::from_be_bytes([high, low]) as usize;

    let mut payload = vec![0u8; len];
    read_exact(reader, &mut payload, deadline).await?;
    Ok(Some(payload))
}

/// Writes one bare peer frame: u16 payload length, then the payload.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame payload of {} bytes exceeds u16 length field", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn read_exact_accumulates_partial_writes() {
        let (mut writer, mut reader) = tokio::io::duplex(8);

        let writer_task = tokio::spawn(async move {
            writer.write_all(b"he").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.write_all(b"llo").await.unwrap();
        });

        let mut buf = [0u8; 5];
        read_exact(&mut reader, &mut buf, soon()).await.expect("read");
        assert_eq!(&buf, b"hello");
        writer_task.await.unwrap();
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        let (_writer, mut reader) = tokio::io::duplex(8);
        let mut buf = [0u8; 1];
        let deadline = Instant::now() + Duration::from_millis(50);
        let result = read_exact(&mut reader, &mut buf, deadline).await;
        assert!(matches!(result, Err(ReadError::Timeout)));
    }

    #[tokio::test]
    async fn closed_stream_is_not_a_timeout() {
        let (writer, mut reader) = tokio::io::duplex(8);
        drop(writer);
        let mut buf = [0u8; 1];
        let result = read_exact(&mut reader, &mut buf, soon()).await;
        assert!(matches!(result, Err(ReadError::Closed)));
    }

    #[tokio::test]
    async fn close_mid_frame_is_an_error_not_eof() {
        let (mut writer, mut reader) = tokio::io::duplex(8);
        writer.write_all(&[0, 4, b'h', b'i']).await.unwrap();
        drop(writer);
        let result = read_frame(&mut reader, soon()).await;
        assert!(matches!(result, Err(ReadError::Closed)));
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        write_frame(&mut writer, b"direct message").await.unwrap();
        let payload = read_frame(&mut reader, soon()).await.unwrap().unwrap();
        assert_eq!(payload, b"direct message");
    }

    #[tokio::test]
    async fn empty_frame_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        write_frame(&mut writer, b"").await.unwrap();
        let payload = read_frame(&mut reader, soon()).await.unwrap().unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn clean_close_before_frame_is_eof() {
        let (writer, mut reader) = tokio::io::duplex(8);
        drop(writer);
        let result = read_frame(&mut reader, soon()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut writer, _reader) = tokio::io::duplex(64);
        let payload = vec![0u8; MAX_FRAME_BYTES + 1];
        let result = write_frame(&mut writer, &payload).await;
        assert!(result.is_err());
    }
}
