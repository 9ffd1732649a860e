use std::net::SocketAddrV4;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::io::{read_chunk, write_all_unlogged, PROXY_READ};
use crate::CRLF;

const MAX_HTTP_RESPONSE_SIZE: usize = 8192;
const HTTP_VERSION_PREFIX: &[u8] = b"HTTP/1.";

/// Tunnel request sent to the upstream proxy.
///
/// ```plain
/// CONNECT <dotted-quad>:<port> HTTP/1.0\r\n
/// \r\n
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpConnectRequest {
    pub addr: SocketAddrV4,
}

impl HttpConnectRequest {
    pub const fn new(addr: SocketAddrV4) -> Self {
        Self { addr }
    }

    pub fn write_to_buf(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(format!("CONNECT {} HTTP/1.0", self.addr).as_bytes());
        buf.extend_from_slice(&CRLF);
        buf.extend_from_slice(&CRLF);
    }

    /// A short write is retried until the whole request is out. Failures are
    /// left for the caller to report.
    pub async fn write_to<W>(&self, w: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(64);
        self.write_to_buf(&mut buf);
        write_all_unlogged(w, &buf).await
    }
}

/// Counts consecutive line endings. A CR never breaks a run so both
/// `\r\n\r\n` and `\n\n` end the head.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadTerminator {
    newlines: u8,
}

impl HeadTerminator {
    /// Returns true once the byte completes the blank line.
    pub fn feed(&mut self, b: u8) -> bool {
        match b {
            b'\n' => {
                self.newlines += 1;
                self.newlines == 2
            }
            b'\r' => false,
            _ => {
                self.newlines = 0;
                false
            }
        }
    }
}

/// Reads the response head into `buf` one byte at a time, so nothing after
/// the blank line is taken off the stream. `buf` keeps whatever was read even
/// on failure.
pub async fn read_http_response_end<R>(r: &mut R, buf: &mut Vec<u8>) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut end = HeadTerminator::default();
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_HTTP_RESPONSE_SIZE {
            bail!("response head exceeds {MAX_HTTP_RESPONSE_SIZE} bytes");
        }
        let n = read_chunk(r, &mut byte, PROXY_READ)
            .await
            .context("Http connect read response failed")?;
        if n == 0 {
            bail!("proxy closed before end of response head");
        }
        buf.push(byte[0]);
        if end.feed(byte[0]) {
            return Ok(());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpConnectResponse {
    pub status: u32,
}

impl HttpConnectResponse {
    /// Parses `HTTP/1.<digits> <status> ...` from the first line of the head.
    pub fn parse(head: &[u8]) -> anyhow::Result<Self> {
        let rest = head
            .strip_prefix(HTTP_VERSION_PREFIX)
            .ok_or_else(|| anyhow!("BadResponse"))?;

        let minor = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if minor == 0 {
            debug!("Bad response version: `{}`", first_line(head));
            bail!("BadResponse");
        }
        let rest = &rest[minor..];
        let skip = rest
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        let status = atoi::atoi::<u32>(&rest[skip..]).ok_or_else(|| {
            debug!("Bad response status: `{}`", first_line(head));
            anyhow!("BadResponse")
        })?;

        Ok(Self { status })
    }

    pub fn is_success(&self) -> bool {
        self.status / 100 == 2
    }
}

/// The status line as it may be logged: cut at the first line break, invalid
/// UTF-8 and control characters replaced.
pub fn first_line(head: &[u8]) -> String {
    let end = head
        .iter()
        .position(|b| *b == b'\r' || *b == b'\n')
        .unwrap_or(head.len());
    String::from_utf8_lossy(&head[..end])
        .chars()
        .map(|c| if c.is_control() { '?' } else { c })
        .collect()
}
