use std::net::SocketAddrV4;

use anyhow::{anyhow, Context};
use tokio::net::TcpStream;
use tracing::debug;

use crate::io::PROXY_CONNECT;
use crate::proto::http_connect::{
    first_line, read_http_response_end, HttpConnectRequest, HttpConnectResponse,
};

/// Opens tunnels to arbitrary IPv4 destinations through one upstream proxy
/// speaking HTTP `CONNECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectDial {
    proxy: SocketAddrV4,
}

impl ConnectDial {
    pub const fn new(proxy: SocketAddrV4) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> SocketAddrV4 {
        self.proxy
    }

    /// Connects to the proxy and completes the handshake. The returned stream
    /// is positioned right after the response head, so whatever the proxy
    /// sends next belongs to the tunnel.
    pub async fn dial(&self, addr: SocketAddrV4) -> anyhow::Result<TcpStream> {
        let mut remote_ts = TcpStream::connect(self.proxy)
            .await
            .context(PROXY_CONNECT)?;

        HttpConnectRequest::new(addr)
            .write_to(&mut remote_ts)
            .await
            .context(PROXY_CONNECT)?;

        let mut head = Vec::new();
        let ret = read_http_response_end(&mut remote_ts, &mut head).await;
        debug!(
            "Http connect {addr} response head: \n{}",
            String::from_utf8_lossy(&head)
        );

        let accepted = ret.and_then(|_| HttpConnectResponse::parse(&head));
        match accepted {
            Ok(resp) if resp.is_success() => Ok(remote_ts),
            _ => Err(anyhow!("bad proxy response: {addr} {}", first_line(&head))),
        }
    }
}
