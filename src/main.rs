use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use proxyt::{
    config::{ArgsConfig, Config},
    daemon::{daemonize, write_pidfile},
    logs::setup_log,
    server::{bind, listen, Server},
};
use proxyt_station::{origdst::NetfilterDst, CRIT};
use tracing::error;

fn main() {
    let progname = std::env::args()
        .next()
        .as_deref()
        .and_then(|p| p.rsplit('/').next())
        .map(str::to_owned)
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());

    let args = match ArgsConfig::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            e.print().ok();
            std::process::exit(code);
        }
    };

    let config = match Config::try_from(args) {
        Ok(config) => config,
        Err(e) => fail(&progname, e),
    };

    let socket = match bind(config.listen) {
        Ok(socket) => socket,
        Err(e) => fail(&progname, anyhow::Error::new(e).context("socket")),
    };

    if !config.debug {
        if let Err(e) = daemonize() {
            fail(&progname, e);
        }
    }

    let guard = setup_log(&progname, config.debug);
    if let Some(path) = &config.pidfile {
        write_pidfile(path);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(target: CRIT, "runtime: {e}");
            std::process::exit(1);
        }
    };

    let ret = runtime.block_on(async move {
        let listener = listen(socket).context("listen")?;
        let server = Server::new(
            listener,
            config.upstream,
            config.max_connections,
            Arc::new(NetfilterDst),
        );
        server.run().await
    });

    if let Err(e) = ret {
        error!(target: CRIT, "{e:#}");
        drop(guard);
        std::process::exit(1);
    }
}

fn fail(progname: &str, e: anyhow::Error) -> ! {
    eprintln!("{progname}: {e:#}");
    std::process::exit(1);
}
