use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use proxyt_station::{dial::ConnectDial, origdst::OriginalDst, proxy::ProxyConnection};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{info_span, Instrument};

/// Bind the listening socket: IPv4, address reuse, all interfaces. Done
/// before detaching so a busy port is reported on the terminal.
pub fn bind(listen: SocketAddrV4) -> io::Result<TcpSocket> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::V4(listen))?;
    Ok(socket)
}

/// Start listening with the platform's maximum backlog. Needs a runtime.
pub fn listen(socket: TcpSocket) -> io::Result<TcpListener> {
    socket.listen(libc::SOMAXCONN as u32)
}

#[derive(Debug, Default)]
struct Counters {
    active: usize,
    next_serial: u64,
}

/// Bounds the number of live flows and hands out serials in accept order.
#[derive(Debug)]
pub struct Admission {
    max: usize,
    counters: Mutex<Counters>,
}

impl Admission {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Admits a flow unless the cap is reached. A refused flow does not
    /// consume a serial.
    pub fn admit(self: &Arc<Self>) -> Option<FlowGuard> {
        let mut c = self.lock();
        if c.active >= self.max {
            return None;
        }
        c.active += 1;
        let serial = c.next_serial;
        c.next_serial += 1;
        Some(FlowGuard {
            serial,
            admission: self.clone(),
        })
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by a flow for its whole life; dropping it accounts the departure.
#[derive(Debug)]
pub struct FlowGuard {
    serial: u64,
    admission: Arc<Admission>,
}

impl FlowGuard {
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.admission.lock().active -= 1;
    }
}

pub struct Server {
    listener: TcpListener,
    dial: ConnectDial,
    lookup: Arc<dyn OriginalDst>,
    admission: Arc<Admission>,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        upstream: SocketAddrV4,
        max_connections: usize,
        lookup: Arc<dyn OriginalDst>,
    ) -> Self {
        Server {
            listener,
            dial: ConnectDial::new(upstream),
            lookup,
            admission: Admission::new(max_connections),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn admission(&self) -> Arc<Admission> {
        self.admission.clone()
    }

    /// Accepts forever. Only a non-transient accept failure returns.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            "Listen for intercepted connections @ {} via proxy {}",
            self.local_addr()?,
            self.dial.proxy()
        );
        loop {
            let ts = self.accept().await.context("accept")?;
            self.dispatch(ts);
        }
    }

    async fn accept(&self) -> io::Result<TcpStream> {
        loop {
            match self.listener.accept().await {
                Ok((ts, _)) => return Ok(ts),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&self, ts: TcpStream) {
        let Some(guard) = self.admission.admit() else {
            error!("too many connections ({})", self.admission.max());
            return;
        };

        let serial = guard.serial();
        let conn = ProxyConnection::new(serial, ts, self.dial, self.lookup.clone());
        let span = info_span!("flow", serial);
        tokio::spawn(
            async move {
                let traffic = conn.handle().await;
                info!(
                    "[{}] disconnect send {}kB received {}kB",
                    serial,
                    traffic.sent_kb(),
                    traffic.recv_kb()
                );
                drop(guard);
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_cap() {
        let admission = Admission::new(2);
        let a = admission.admit().unwrap();
        let b = admission.admit().unwrap();
        assert!(admission.admit().is_none());
        assert_eq!(admission.active(), 2);

        drop(a);
        assert_eq!(admission.active(), 1);
        let c = admission.admit().unwrap();
        assert_eq!((b.serial(), c.serial()), (1, 2));
    }

    #[test]
    fn test_rejected_flow_keeps_serials_contiguous() {
        let admission = Admission::new(1);
        let mut serials = Vec::new();
        for _ in 0..5 {
            let guard = admission.admit().unwrap();
            assert!(admission.admit().is_none());
            serials.push(guard.serial());
        }
        assert_eq!(serials, vec![0, 1, 2, 3, 4]);
        assert_eq!(admission.active(), 0);
    }

    #[test]
    fn test_admission_across_threads() {
        let admission = Admission::new(8);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let admission = admission.clone();
                std::thread::spawn(move || {
                    let guard = admission.admit();
                    assert!(admission.active() <= 8);
                    guard.map(|g| g.serial())
                })
            })
            .collect();

        let mut serials: Vec<u64> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        serials.sort_unstable();
        let expected: Vec<u64> = (0..serials.len() as u64).collect();
        assert_eq!(serials, expected);
        assert_eq!(admission.active(), 0);
    }

    #[tokio::test]
    async fn test_bind_and_listen() {
        let socket = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = listen(socket).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}
