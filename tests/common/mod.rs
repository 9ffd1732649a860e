use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use proxyt_station::{
    dial::ConnectDial, origdst::OriginalDst, proxy::ProxyConnection, relay::Traffic,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::subscriber::DefaultGuard;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Collects formatted log records for the current thread. Tests run on the
/// single threaded runtime, so spawned flows log into the same buffer.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

#[allow(dead_code)]
impl LogCapture {
    /// Routes INFO and above here until the guard is dropped.
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(Level::INFO)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf).lines().map(str::to_owned).collect()
    }

    /// The first record containing `needle`, panicking with everything
    /// captured so far if there is none.
    pub fn line_with(&self, needle: &str) -> String {
        let lines = self.lines();
        match lines.iter().find(|l| l.contains(needle)) {
            Some(line) => line.clone(),
            None => panic!("no log line with {needle:?} in {lines:#?}"),
        }
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Pretends every connection was redirected from `self.0`.
#[derive(Debug)]
pub struct FixedDst(pub SocketAddrV4);

impl OriginalDst for FixedDst {
    fn original_dst(&self, _ts: &TcpStream) -> io::Result<SocketAddrV4> {
        Ok(self.0)
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum After {
    /// echo everything back, then close once the proxy half-closes
    Echo,
    /// drain until the proxy closes
    Hold,
    /// close right after the reply
    Close,
}

#[allow(dead_code)]
pub struct Upstream {
    pub addr: SocketAddrV4,
    pub requests: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[allow(dead_code)]
pub fn v4(sa: SocketAddr) -> SocketAddrV4 {
    match sa {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(v6) => panic!("unexpected ipv6 address {v6}"),
    }
}

/// A fake CONNECT proxy: reads the request head, reports it, answers with
/// `reply` and then behaves as `after` says.
#[allow(dead_code)]
pub async fn start_upstream(reply: &'static [u8], after: After) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = v4(listener.local_addr().unwrap());
    let (tx, requests) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (ts, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move { serve_upstream(ts, reply, after, tx).await });
        }
    });
    Upstream { addr, requests }
}

async fn serve_upstream(
    mut ts: TcpStream,
    reply: &'static [u8],
    after: After,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        match ts.read_u8().await {
            Ok(b) => head.push(b),
            Err(_) => return,
        }
    }
    tx.send(head).ok();

    if ts.write_all(reply).await.is_err() {
        return;
    }
    match after {
        After::Echo => {
            let (mut r, mut w) = ts.split();
            tokio::io::copy(&mut r, &mut w).await.ok();
            w.shutdown().await.ok();
        }
        After::Hold => {
            let mut sink = Vec::new();
            ts.read_to_end(&mut sink).await.ok();
        }
        After::Close => {}
    }
}

/// Accepts one client and runs a single flow on it, as the listener would.
/// Returns the client side and the flow's outcome.
#[allow(dead_code)]
pub async fn start_flow(upstream: SocketAddrV4, dst: SocketAddrV4) -> (TcpStream, JoinHandle<Traffic>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (ts, _) = accepted.unwrap();

    let conn = ProxyConnection::new(0, ts, ConnectDial::new(upstream), Arc::new(FixedDst(dst)));
    let flow = tokio::spawn(conn.handle());
    (client.unwrap(), flow)
}
