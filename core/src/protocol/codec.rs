//! Length-prefixed framing over an ordered byte stream

use super::serialize::{decode_message, encode_message};
use super::Envelope;
use crate::error::{NetworkErrorKind, Result, SyncError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Write one envelope as `len:u32be || protobuf`
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope, max_frame_bytes: usize) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_message(envelope)?;
    if body.len() > max_frame_bytes {
        return Err(SyncError::network(
            NetworkErrorKind::FrameTooLarge,
            format!("{} frame of {} bytes exceeds {}", envelope.label(), body.len(), max_frame_bytes),
        ));
    }
    let len = u32::try_from(body.len()).map_err(|_| {
        SyncError::network(NetworkErrorKind::FrameTooLarge, "frame length overflows u32")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(FRAME_HEADER_LEN + body.len())
}

/// Read one envelope; `Ok(None)` when the stream closed between frames
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<(Envelope, usize)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_bytes {
        return Err(SyncError::network(
            NetworkErrorKind::FrameTooLarge,
            format!("incoming frame of {} bytes exceeds {}", len, max_frame_bytes),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let envelope = decode_message(&body)?;
    Ok(Some((envelope, FRAME_HEADER_LEN + len)))
}
