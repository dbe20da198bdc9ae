//! Detaching from the controlling terminal.
//!
//! Must run before the tokio runtime is built: `fork()` only duplicates
//! the calling thread, so forking a multi-threaded process would leave
//! the child with runtime locks held by threads that no longer exist.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;

/// Double-fork into the background, start a new session, change to `/`
/// and point stdin/stdout/stderr at `/dev/null`.
///
/// Returns in the daemon process only; both parents exit with status 0.
pub fn daemonize() -> io::Result<()> {
    fork_and_exit_parent()?;

    // SAFETY: plain syscall with no pointers.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    // The session leader exits so the daemon can never reacquire a terminal.
    fork_and_exit_parent()?;

    std::env::set_current_dir("/")?;
    redirect_stdio()
}

fn fork_and_exit_parent() -> io::Result<()> {
    // SAFETY: the caller guarantees the process is single-threaded.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}

fn redirect_stdio() -> io::Result<()> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.as_raw_fd();

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open; dup2 replaces `target` atomically.
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
