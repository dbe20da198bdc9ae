//! TCP server for the packet log.
//!
//! Owns the listening socket, accepts clients until shutdown is requested,
//! and runs the shutdown sequence: close the listener, wait for in-flight
//! connections, then delete the log.

use crate::config::{Config, ServeMode};
use crate::connection::Connection;
use crate::shutdown::Shutdown;
use crate::storage::{LogStore, OpenMode, StoreError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// Pause after a failed accept so a persistent error (EMFILE) cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Create the listening socket.
///
/// This is synchronous so it can run before daemonizing and before the
/// async runtime exists; failures here are fatal startup errors.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(ServerError::Socket)?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket
        .listen(backlog)
        .map_err(|e| ServerError::Listen(addr, e))?;

    Ok(socket.into())
}

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
    store: Arc<LogStore>,
    shutdown: Shutdown,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Adopt a bound listener and open the packet log.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(
        config: Config,
        listener: std::net::TcpListener,
        shutdown: Shutdown,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::from_std(listener).map_err(ServerError::Socket)?;
        let local_addr = listener.local_addr().map_err(ServerError::Socket)?;

        let mode = if config.truncate_on_start {
            OpenMode::Truncate
        } else {
            OpenMode::Reuse
        };
        let store = LogStore::open(&config.data_file, mode, config.fsync)
            .await
            .map_err(ServerError::Store)?;

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
            local_addr,
            store: Arc::new(store),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve clients until shutdown, then clean up.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            address = %self.local_addr,
            mode = ?self.config.mode,
            data_file = %self.config.data_file.display(),
            "Server listening"
        );

        let mut tasks = JoinSet::new();

        while !self.shutdown.is_set() {
            let permit = match self.config.mode {
                ServeMode::Sequential => None,
                ServeMode::Concurrent => match self.acquire_slot().await {
                    Some(permit) => Some(permit),
                    None => break,
                },
            };

            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.shutdown.wait() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Accepted connection");
                    match permit {
                        None => {
                            self.connection(stream, peer).run().await;
                        }
                        Some(permit) => {
                            let conn = self.connection(stream, peer);
                            tasks.spawn(
                                async move {
                                    conn.run().await;
                                    drop(permit);
                                }
                                .in_current_span(),
                            );
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    accept_backoff(&self.shutdown).await;
                }
            }

            while let Some(res) = tasks.try_join_next() {
                log_task_result(res);
            }
        }

        self.finish(tasks).await;
        Ok(())
    }

    /// Wait for a concurrent-mode connection slot, or `None` on shutdown.
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        if self.connection_limit.available_permits() == 0 {
            warn!(
                max_connections = self.config.max_connections,
                "Connection limit reached"
            );
        }
        tokio::select! {
            permit = Arc::clone(&self.connection_limit).acquire_owned() => permit.ok(),
            _ = self.shutdown.wait() => None,
        }
    }

    fn connection(&self, stream: TcpStream, peer: SocketAddr) -> Connection<TcpStream> {
        Connection::new(
            stream,
            peer,
            Arc::clone(&self.store),
            self.shutdown.clone(),
            self.config.recv_chunk_size,
        )
    }

    /// Shutdown sequence. The listener is closed before the log is
    /// deleted so no new client can append to a log being removed.
    async fn finish(self, mut tasks: JoinSet<()>) {
        info!("Shutting down");

        let Server {
            listener, store, ..
        } = self;
        drop(listener);
        debug!("Listening socket closed");

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for connections to close");
        }
        while let Some(res) = tasks.join_next().await {
            log_task_result(res);
        }

        let stats = store.stats().await;
        info!(
            packets = stats.packets,
            bytes_appended = stats.bytes_appended,
            size = stats.size,
            "Packet log summary"
        );

        if let Err(e) = store.reset().await {
            error!(error = %e, "Failed to remove packet log");
        }
    }
}

/// Sleep for `ACCEPT_BACKOFF`, cut short by shutdown.
async fn accept_backoff(shutdown: &Shutdown) {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
        _ = shutdown.wait() => {}
    }
}

fn log_task_result(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        error!(error = %e, "Connection task failed");
    }
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    Socket(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(SocketAddr, io::Error),
    Signal(io::Error),
    Store(StoreError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Socket(e) => write!(f, "Socket setup failed: {e}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
            ServerError::Listen(addr, e) => write!(f, "Failed to listen on {addr}: {e}"),
            ServerError::Signal(e) => write!(f, "Failed to install signal handlers: {e}"),
            ServerError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Socket(e)
            | ServerError::Bind(_, e)
            | ServerError::Listen(_, e)
            | ServerError::Signal(e) => Some(e),
            ServerError::Store(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_log_path;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const IO_TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config(tag: &str, mode: ServeMode) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            backlog: 10,
            mode,
            max_connections: 8,
            recv_chunk_size: 1024,
            daemon: false,
            data_file: temp_log_path(tag),
            truncate_on_start: true,
            fsync: false,
            log_level: "info".to_string(),
            log_file: None,
        }
    }

    struct Running {
        addr: SocketAddr,
        data_file: PathBuf,
        shutdown: Shutdown,
        handle: JoinHandle<Result<(), ServerError>>,
    }

    impl Running {
        async fn stop(self) {
            self.shutdown.trigger();
            timeout(IO_TIMEOUT, self.handle)
                .await
                .expect("server should stop")
                .unwrap()
                .unwrap();
        }
    }

    async fn start(config: Config) -> Running {
        let listener = bind_listener(config.listen, config.backlog).unwrap();
        let shutdown = Shutdown::new();
        let data_file = config.data_file.clone();
        let server = Server::new(config, listener, shutdown.clone()).await.unwrap();
        let addr = server.local_addr();
        let handle = tokio::spawn(server.run());
        Running {
            addr,
            data_file,
            shutdown,
            handle,
        }
    }

    async fn exchange(stream: &mut TcpStream, packet: &[u8], expected: &[u8]) {
        stream.write_all(packet).await.unwrap();
        let mut reply = vec![0u8; expected.len()];
        timeout(IO_TIMEOUT, stream.read_exact(&mut reply))
            .await
            .expect("reply should arrive")
            .unwrap();
        assert_eq!(reply, expected);
    }

    #[test]
    fn test_bind_listener_reports_bind_error() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let taken = first.local_addr().unwrap();
        // SO_REUSEADDR does not allow two listeners on one port.
        assert!(matches!(
            bind_listener(taken, 10),
            Err(ServerError::Bind(..))
        ));
    }

    #[test]
    fn test_error_source_is_preserved() {
        use std::error::Error;

        let first = bind_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let err = bind_listener(first.local_addr().unwrap(), 10).unwrap_err();
        let source = err.source().expect("bind error should carry its cause");
        let io_err = source.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::AddrInUse);

        let err = ServerError::Store(StoreError::Read(
            PathBuf::from("missing.log"),
            io::Error::from(io::ErrorKind::NotFound),
        ));
        assert!(err.source().unwrap().downcast_ref::<StoreError>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_backoff_waits() {
        let shutdown = Shutdown::new();
        let started = tokio::time::Instant::now();
        accept_backoff(&shutdown).await;
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_backoff_ends_on_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let started = tokio::time::Instant::now();
        accept_backoff(&shutdown).await;
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_single_client_round_trip() {
        let running = start(test_config("srv-single", ServeMode::Sequential)).await;

        let mut client = TcpStream::connect(running.addr).await.unwrap();
        exchange(&mut client, b"hello\n", b"hello\n").await;
        exchange(&mut client, b"world\n", b"hello\nworld\n").await;
        drop(client);

        running.stop().await;
    }

    #[tokio::test]
    async fn test_sequential_clients_share_log() {
        let running = start(test_config("srv-sequential", ServeMode::Sequential)).await;

        let mut first = TcpStream::connect(running.addr).await.unwrap();
        exchange(&mut first, b"a\n", b"a\n").await;
        drop(first);

        let mut second = TcpStream::connect(running.addr).await.unwrap();
        exchange(&mut second, b"b\n", b"a\nb\n").await;
        drop(second);

        running.stop().await;
    }

    #[tokio::test]
    async fn test_unterminated_packet_is_not_logged() {
        let running = start(test_config("srv-partial", ServeMode::Sequential)).await;

        let mut first = TcpStream::connect(running.addr).await.unwrap();
        first.write_all(b"abc").await.unwrap();
        drop(first);

        let mut second = TcpStream::connect(running.addr).await.unwrap();
        exchange(&mut second, b"z\n", b"z\n").await;
        drop(second);

        running.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_partial_packet_removes_log() {
        let running = start(test_config("srv-shutdown", ServeMode::Sequential)).await;

        let mut client = TcpStream::connect(running.addr).await.unwrap();
        exchange(&mut client, b"kept\n", b"kept\n").await;
        client.write_all(b"never-terminated").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let addr = running.addr;
        let data_file = running.data_file.clone();
        assert!(data_file.exists());
        running.stop().await;

        assert!(!data_file.exists());
        // The listening socket is gone.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_clients_see_own_packets() {
        let running = start(test_config("srv-concurrent", ServeMode::Concurrent)).await;

        // Both clients connect before either sends.
        let mut one = TcpStream::connect(running.addr).await.unwrap();
        let mut two = TcpStream::connect(running.addr).await.unwrap();

        one.write_all(b"one\n").await.unwrap();
        two.write_all(b"two\n").await.unwrap();

        let reply_one = read_reply(&mut one, b"one\n", b"two\n").await;
        let reply_two = read_reply(&mut two, b"two\n", b"one\n").await;
        // Exactly one append went first, so exactly one reply is short.
        let one_first = reply_one == b"one\n";
        assert_ne!(one_first, reply_two == b"two\n");

        let expected: &[u8] = if one_first {
            b"one\ntwo\nthree\n"
        } else {
            b"two\none\nthree\n"
        };
        exchange(&mut one, b"three\n", expected).await;

        drop(one);
        drop(two);
        running.stop().await;
    }

    /// Read the reply to `own`, which may or may not include `other` first.
    async fn read_reply(stream: &mut TcpStream, own: &[u8], other: &[u8]) -> Vec<u8> {
        let mut reply = vec![0u8; own.len()];
        timeout(IO_TIMEOUT, stream.read_exact(&mut reply))
            .await
            .expect("reply should arrive")
            .unwrap();
        if reply == own {
            return reply;
        }

        let mut rest = vec![0u8; other.len()];
        timeout(IO_TIMEOUT, stream.read_exact(&mut rest))
            .await
            .expect("reply should arrive")
            .unwrap();
        reply.extend_from_slice(&rest);
        assert_eq!(reply, [other, own].concat());
        reply
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_closes_idle_clients() {
        let running = start(test_config("srv-concurrent-stop", ServeMode::Concurrent)).await;

        let mut idle = TcpStream::connect(running.addr).await.unwrap();
        exchange(&mut idle, b"x\n", b"x\n").await;

        let data_file = running.data_file.clone();
        running.stop().await;
        assert!(!data_file.exists());

        // The server side was closed during shutdown.
        let mut buf = [0u8; 1];
        let n = timeout(IO_TIMEOUT, idle.read(&mut buf))
            .await
            .expect("read should finish")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
