use std::ffi::{c_int, CString};
use std::io;
use std::sync::{Mutex, PoisonError};

use proxyt_station::CRIT;
use time::macros::format_description;
use time::UtcOffset;
use tracing::metadata::LevelFilter;
use tracing::{Level, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        layer,
        time::{FormatTime, OffsetTime},
        MakeWriter,
    },
    prelude::__tracing_subscriber_SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

static SYSLOG_LOCK: Mutex<()> = Mutex::new(());

/// Daemon logging: every record goes to syslog, and in debug mode is
/// mirrored to stderr. Must run after detaching, the stderr worker thread
/// would not survive a fork. Keep the guard alive until exit so buffered
/// lines get flushed.
pub fn setup_log(progname: &str, debug: bool) -> Option<WorkerGuard> {
    let timer = local_timer();
    let syslog = Syslog::open(progname);

    let mut layers = Vec::new();
    let sys = syslog_layer(syslog)
        .with_filter(default_env_filter())
        .boxed();
    layers.push(sys);

    let guard = if debug {
        let (stderr, guard) = tracing_appender::non_blocking(io::stderr());
        let stderr = layer()
            .with_writer(stderr)
            .with_timer(timer)
            .with_filter(default_env_filter())
            .boxed();
        layers.push(stderr);
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry().with(layers).try_init().ok();
    guard
}

/// syslog stamps time and priority itself, so only the message goes out.
fn syslog_layer<S, W>(writer: W) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    layer()
        .with_writer(writer)
        .with_ansi(false)
        .without_time()
        .with_level(false)
        .with_target(false)
}

/// Plain stdout logging for tests and tools. Safe to call more than once.
pub fn init_log() {
    let stdout = layer()
        .with_timer(local_timer())
        .with_line_number(true)
        .with_filter(default_env_filter());

    tracing_subscriber::registry().with(stdout).try_init().ok();
}

fn local_timer() -> impl FormatTime {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(
        offset,
        format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3][offset_hour sign:mandatory][offset_minute]"
        ),
    )
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// `MakeWriter` handing each formatted record to `syslog(3)` under the
/// daemon facility.
#[derive(Debug, Clone, Copy)]
pub struct Syslog;

impl Syslog {
    pub fn open(progname: &str) -> Self {
        let ident = CString::new(progname).unwrap_or_else(|_| c"proxyt".to_owned());
        // openlog keeps the pointer, so the ident lives for the process
        let ident: &'static CString = Box::leak(Box::new(ident));
        // SAFETY: ident is a valid NUL terminated string that is never freed
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
        Syslog
    }
}

pub fn syslog_priority(target: &str, level: &Level) -> c_int {
    if target == CRIT {
        return libc::LOG_CRIT;
    }
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        _ => libc::LOG_DEBUG,
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter {
            priority: libc::LOG_INFO,
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter {
            priority: syslog_priority(meta.target(), meta.level()),
        }
    }
}

pub struct SyslogWriter {
    priority: c_int,
}

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        let line = line.trim_end_matches('\n').replace('\0', "?");
        let msg = CString::new(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let _serial = SYSLOG_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe { libc::syslog(self.priority, c"%s".as_ptr(), msg.as_ptr()) };
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct Lines(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Lines {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Lines {
        type Writer = Lines;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_syslog_line_is_bare_message() {
        let lines = Lines::default();
        let subscriber = tracing_subscriber::registry().with(syslog_layer(lines.clone()));
        tracing::subscriber::with_default(subscriber, || {
            error!(target: CRIT, "connection loop detected -- missing iptables entry for proxy?");
            info!("[7] connect: 10.0.0.1:443");
        });

        let out = String::from_utf8(lines.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            out,
            "connection loop detected -- missing iptables entry for proxy?\n[7] connect: 10.0.0.1:443\n"
        );
    }

    #[test]
    fn test_priority_mapping() {
        assert_eq!(syslog_priority("proxyt", &Level::ERROR), libc::LOG_ERR);
        assert_eq!(syslog_priority("proxyt", &Level::WARN), libc::LOG_WARNING);
        assert_eq!(syslog_priority("proxyt", &Level::INFO), libc::LOG_INFO);
        assert_eq!(syslog_priority("proxyt", &Level::TRACE), libc::LOG_DEBUG);
        assert_eq!(syslog_priority(CRIT, &Level::ERROR), libc::LOG_CRIT);
    }

    #[test]
    fn test_init_log_twice() {
        init_log();
        init_log();
    }
}
