//! Length-prefixed frames so request/response messages can share one stream
//! without framing ambiguity.
//!
//! Every frame is a little-endian `u32` payload length followed by exactly
//! that many payload bytes. A clean end-of-stream before a length prefix is
//! reported as `None`; an end-of-stream inside a frame is an error.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Anything larger is treated as a corrupt
/// stream rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit of {MAX_FRAME_LEN}", data.len());
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("peer announced a frame of {len} bytes, limit is {MAX_FRAME_LEN}");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
