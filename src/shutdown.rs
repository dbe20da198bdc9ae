//! Process-wide shutdown flag and the signal listener that sets it.
//!
//! The flag is an `AtomicBool` for cheap polling at loop boundaries, paired
//! with a watch channel so blocked accepts, reads and writes can race
//! against it in `tokio::select!`. Once set it is never cleared.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

struct Inner {
    flag: AtomicBool,
    notify: watch::Sender<bool>,
}

/// Cloneable handle to the shutdown flag.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                notify,
            }),
        }
    }

    /// Set the flag and wake every waiter.
    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut rx = self.inner.notify.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Set by a signal that arrives before the runtime exists.
static EARLY_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn record_early_signal(_signo: libc::c_int) {
    EARLY_SIGNAL.store(true, Ordering::SeqCst);
}

/// Install flag-only SIGINT/SIGTERM handlers for the startup window
/// (bind, daemonize, runtime build). `listen_for_signals` picks up
/// anything they recorded.
pub fn install_early_handlers() -> io::Result<()> {
    for signo in [libc::SIGINT, libc::SIGTERM] {
        install_early_handler(signo)?;
    }
    Ok(())
}

fn install_early_handler(signo: libc::c_int) -> io::Result<()> {
    // SAFETY: the handler only stores to an atomic, which is
    // async-signal-safe; `action` is fully initialized before use.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = record_early_signal as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signo, &action, std::ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Register SIGINT and SIGTERM and trigger `shutdown` on the first one.
///
/// Registration failures are returned so startup can abort; the spawned
/// task only reacts after tokio's own handler has recorded the signal.
/// A signal caught by the early handlers triggers `shutdown` at once.
pub fn listen_for_signals(shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    if EARLY_SIGNAL.load(Ordering::SeqCst) {
        info!("Caught signal during startup");
        shutdown.trigger();
    }

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!(signal = "SIGINT", "Caught signal"),
            _ = sigterm.recv() => info!(signal = "SIGTERM", "Caught signal"),
        }
        shutdown.trigger();
    }))
}
