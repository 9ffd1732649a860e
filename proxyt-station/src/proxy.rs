use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{error, info};

use crate::dial::ConnectDial;
use crate::origdst::OriginalDst;
use crate::relay::{relay, Traffic};
use crate::CRIT;

/// One intercepted client connection, from accept until both directions of
/// the tunnel are closed.
#[derive(Debug)]
pub struct ProxyConnection {
    serial: u64,
    ts: TcpStream,
    dial: ConnectDial,
    lookup: Arc<dyn OriginalDst>,
}

impl ProxyConnection {
    pub fn new(serial: u64, ts: TcpStream, dial: ConnectDial, lookup: Arc<dyn OriginalDst>) -> Self {
        Self {
            serial,
            ts,
            dial,
            lookup,
        }
    }

    /// Recovers the destination, opens the tunnel and relays until done.
    /// Failures are logged here; the traffic is zero for flows that never
    /// reached the relay. Both sockets are closed on return.
    pub async fn handle(self) -> Traffic {
        let dst = match self.lookup.original_dst(&self.ts) {
            Ok(dst) => dst,
            Err(e) => {
                error!("cannot get original IP address: {e}");
                return Traffic::default();
            }
        };
        info!("[{}] connect: {}", self.serial, dst);

        if dst.ip() == self.dial.proxy().ip() {
            error!(
                target: CRIT,
                "connection loop detected -- missing iptables entry for proxy?"
            );
            return Traffic::default();
        }

        let remote = match self.dial.dial(dst).await {
            Ok(remote) => remote,
            Err(e) => {
                error!("{e:#}");
                return Traffic::default();
            }
        };

        relay(self.ts, remote).await
    }
}
