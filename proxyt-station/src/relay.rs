//! Bidirectional byte relay between the intercepted client and the tunnel.
//!
//! Two pumps, one per direction. Each copies until its source reports end of
//! stream or an error, then half-closes its sink so the peer sees EOF. The
//! reader pump (local to remote) runs on the flow's own task; the writer pump
//! (remote to local) is a sibling task joined before the sockets are dropped.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::io::{
    read_chunk, write_all_chunks, LOCAL_READ, LOCAL_WRITE, REMOTE_READ, REMOTE_WRITE,
};

pub const RELAY_BUF_SIZE: usize = 8 * 1024;

/// Bytes moved by one flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Traffic {
    /// local to remote
    pub sent: u64,
    /// remote to local
    pub recv: u64,
}

impl Traffic {
    pub fn sent_kb(&self) -> u64 {
        self.sent.div_ceil(1024)
    }

    pub fn recv_kb(&self) -> u64 {
        self.recv.div_ceil(1024)
    }
}

/// Names one direction for the warnings the I/O primitives emit.
#[derive(Debug, Clone, Copy)]
pub struct Direction {
    pub read_ctx: &'static str,
    pub write_ctx: &'static str,
}

pub const UPSTREAM: Direction = Direction {
    read_ctx: LOCAL_READ,
    write_ctx: REMOTE_WRITE,
};

pub const DOWNSTREAM: Direction = Direction {
    read_ctx: REMOTE_READ,
    write_ctx: LOCAL_WRITE,
};

/// Copies `r` into `w` until EOF or error on either side, then shuts down
/// the write side of `w` exactly once. Returns the bytes read from `r`,
/// including a last chunk whose forwarding failed.
pub async fn pump<R, W>(r: &mut R, w: &mut W, dir: Direction) -> u64
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match read_chunk(r, &mut buf, dir.read_ctx).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        total += n as u64;
        if write_all_chunks(w, &buf[..n], dir.write_ctx).await.is_err() {
            break;
        }
    }

    if let Err(e) = w.shutdown().await {
        debug!("{} shutdown: {e}", dir.write_ctx);
    }
    total
}

/// Runs both pumps to completion and reports what each carried.
pub async fn relay(local: TcpStream, remote: TcpStream) -> Traffic {
    let (mut local_r, mut local_w) = local.into_split();
    let (mut remote_r, mut remote_w) = remote.into_split();

    let writer =
        tokio::spawn(async move { pump(&mut remote_r, &mut local_w, DOWNSTREAM).await });

    let sent = pump(&mut local_r, &mut remote_w, UPSTREAM).await;
    let recv = match writer.await {
        Ok(n) => n,
        Err(e) => {
            debug!("writer pump aborted: {e}");
            0
        }
    };

    Traffic { sent, recv }
}
