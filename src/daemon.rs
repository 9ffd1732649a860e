use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::Context;
use tracing::warn;

/// Detach from the terminal: fork, let the parent exit, start a new session
/// and point the standard descriptors at `/dev/null`. Call before any thread
/// is started.
pub fn daemonize() -> anyhow::Result<()> {
    let devnull = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;

    // SAFETY: single threaded at this point, the child only continues with
    // plain libc calls before returning to ordinary Rust code.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()).context("fork"),
        0 => {}
        _ => std::process::exit(0),
    }

    unsafe {
        libc::setsid();
        let fd = devnull.as_raw_fd();
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(fd, target) < 0 {
                return Err(io::Error::last_os_error()).context("redirect to /dev/null");
            }
        }
    }
    Ok(())
}

/// Record our pid as `<pid>\n`. A pid file we cannot write is not worth
/// refusing to run over; it is logged and ignored.
pub fn write_pidfile(path: &Path) {
    if let Err(e) = fs::write(path, format!("{}\n", std::process::id())) {
        warn!("pidfile {}: {e}", path.display());
    }
}
