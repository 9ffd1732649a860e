//! Interruption tolerant byte I/O.
//!
//! Every read and write on a flow goes through these helpers. They retry on
//! `Interrupted`, log hard failures at WARNING tagged with the caller's
//! context and hand the error back without further wrapping.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

pub const LOCAL_READ: &str = "local read";
pub const LOCAL_WRITE: &str = "local write";
pub const REMOTE_READ: &str = "remote read";
pub const REMOTE_WRITE: &str = "remote write";
pub const PROXY_READ: &str = "proxy read";
pub const PROXY_CONNECT: &str = "proxy connect";

/// Read at most `buf.len()` bytes. `Ok(0)` is an orderly end of stream.
pub async fn read_chunk<R>(r: &mut R, buf: &mut [u8], ctx: &str) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        match r.read(buf).await {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("{ctx}: {e}");
                return Err(e);
            }
        }
    }
}

/// Write some prefix of `buf`, returning how much was taken. Never `Ok(0)`
/// for a non-empty buffer: a zero length write is reported as `WriteZero`.
pub async fn write_chunk<W>(w: &mut W, buf: &[u8], ctx: &str) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_retrying(w, buf).await.map_err(|e| {
        warn!("{ctx}: {e}");
        e
    })
}

async fn write_retrying<W>(w: &mut W, buf: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        match w.write(buf).await {
            Ok(0) if !buf.is_empty() => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Loop [`write_chunk`] until the whole buffer is drained.
pub async fn write_all_chunks<W>(w: &mut W, mut buf: &[u8], ctx: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while !buf.is_empty() {
        let n = write_chunk(w, buf, ctx).await?;
        buf = &buf[n..];
    }
    Ok(())
}

/// Like [`write_all_chunks`] but leaves reporting to the caller, for writes
/// whose failure is logged once further up.
pub async fn write_all_unlogged<W>(w: &mut W, mut buf: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while !buf.is_empty() {
        let n = write_retrying(w, buf).await?;
        buf = &buf[n..];
    }
    Ok(())
}
