use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::Parser;

const IPTABLES_HELP: &str = "\
To proxy all outgoing connections to PROXYHOST you will need something like this
in iptables:

    iptables -t nat -A OUTPUT -p tcp -m tcp -d PROXYHOST/32 -j ACCEPT
    iptables -t nat -A OUTPUT -p tcp -m tcp -d 127.0.0.0/8 -j ACCEPT
    iptables -t nat -A OUTPUT -p tcp -m tcp -d 10.0.0.0/8 -j ACCEPT
    iptables -t nat -A OUTPUT -p tcp -m tcp -d 172.16.0.0/12 -j ACCEPT
    iptables -t nat -A OUTPUT -p tcp -m tcp -d 192.168.0.0/16 -j ACCEPT
    iptables -t nat -A OUTPUT -p tcp -m tcp ! --dport 3128 \\
             -j REDIRECT --to-port PORT

You may want to add further ACCEPT commands (before the REDIRECT) for other
locally reachable networks.";

/// Transparent proxy for local connections to a proxy supporting CONNECT
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, after_help = IPTABLES_HELP)]
pub struct ArgsConfig {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3128)]
    pub port: u16,

    /// Maximum number of concurrent connections
    #[arg(short, long = "max-connections", default_value_t = 256)]
    pub max_connections: usize,

    /// Record the pid of the detached daemon in this file
    #[arg(short = 'i', long)]
    pub pidfile: Option<PathBuf>,

    /// Stay in the foreground and mirror logs to stderr
    #[arg(short, long)]
    pub debug: bool,

    /// Upstream proxy host, dotted quad or name
    #[arg(value_name = "PROXYHOST")]
    pub proxy_host: String,

    /// Upstream proxy port
    #[arg(value_name = "PROXYPORT")]
    pub proxy_port: u16,
}

/// Settings fixed at startup and shared read-only by every flow.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddrV4,
    pub upstream: SocketAddrV4,
    pub max_connections: usize,
    pub pidfile: Option<PathBuf>,
    pub debug: bool,
}

impl TryFrom<ArgsConfig> for Config {
    type Error = anyhow::Error;

    fn try_from(args: ArgsConfig) -> anyhow::Result<Self> {
        if args.max_connections == 0 {
            bail!("max-connections must be at least 1");
        }
        let upstream = resolve_upstream(&args.proxy_host, args.proxy_port)?;
        Ok(Config {
            listen: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, args.port),
            upstream,
            max_connections: args.max_connections,
            pidfile: args.pidfile,
            debug: args.debug,
        })
    }
}

/// Dotted quad first, then the system resolver; the first IPv4 answer wins.
pub fn resolve_upstream(host: &str, port: u16) -> anyhow::Result<SocketAddrV4> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("unknown host {host}"))?
        .find_map(|sa| match sa {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("unknown host {host}"))
}
