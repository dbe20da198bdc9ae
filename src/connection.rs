//! Connection state machine for a single client.
//!
//! Each connection owns its residual buffer and moves through
//! `Receiving -> (PacketReady)* -> Closed`. Every complete packet is
//! appended to the shared log, and the full log is written back before
//! the next packet is handled.

use crate::framer;
use crate::shutdown::Shutdown;
use crate::storage::{LogStore, StoreError};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for bytes from the peer.
    Receiving,
    /// A complete packet is being appended and answered.
    PacketReady,
    /// Finished; the socket and buffer are released.
    Closed,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer closed its side (zero-length read).
    PeerClosed,
    /// The shutdown flag was observed.
    Shutdown,
    /// Receiving from the peer failed.
    RecvFailed(io::Error),
    /// Appending to or reading back the log failed.
    Store(StoreError),
    /// Writing the reply to the peer failed.
    SendFailed(io::Error),
}

impl CloseReason {
    /// Whether the connection ended because something went wrong.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CloseReason::RecvFailed(_) | CloseReason::Store(_) | CloseReason::SendFailed(_)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed connection"),
            CloseReason::Shutdown => write!(f, "server shutting down"),
            CloseReason::RecvFailed(e) => write!(f, "recv failed: {e}"),
            CloseReason::Store(e) => write!(f, "{e}"),
            CloseReason::SendFailed(e) => write!(f, "send failed: {e}"),
        }
    }
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    /// Bytes received after the last delimiter.
    residual: BytesMut,
    /// Fixed-size receive chunk.
    scratch: Vec<u8>,
    store: Arc<LogStore>,
    shutdown: Shutdown,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        store: Arc<LogStore>,
        shutdown: Shutdown,
        recv_chunk_size: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Receiving,
            residual: BytesMut::new(),
            scratch: vec![0u8; recv_chunk_size],
            store,
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Serve the connection until the peer leaves, an error occurs, or
    /// shutdown is requested. Consumes the connection, closing the socket.
    pub async fn run(mut self) -> CloseReason {
        let reason = self.receive_loop().await;

        if !self.residual.is_empty() {
            debug!(
                peer = %self.peer,
                bytes = self.residual.len(),
                "Discarding unterminated packet"
            );
        }
        self.transition(ConnState::Closed);

        if reason.is_error() {
            error!(peer = %self.peer, error = %reason, "Connection failed");
        }
        info!(peer = %self.peer, reason = %reason, "Closed connection");

        reason
    }

    async fn receive_loop(&mut self) -> CloseReason {
        loop {
            if self.shutdown.is_set() {
                return CloseReason::Shutdown;
            }

            let received = tokio::select! {
                res = self.stream.read(&mut self.scratch) => res,
                _ = self.shutdown.wait() => return CloseReason::Shutdown,
            };

            let n = match received {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return CloseReason::RecvFailed(e),
            };
            trace!(peer = %self.peer, bytes = n, "Received chunk");

            if let Err(reason) = self.process_chunk(n).await {
                return reason;
            }
        }
    }

    /// Frame the first `len` scratch bytes and handle every packet found.
    ///
    /// A failing packet is dropped together with the rest of the connection.
    async fn process_chunk(&mut self, len: usize) -> Result<(), CloseReason> {
        let residual = std::mem::take(&mut self.residual);
        let framed = framer::feed(residual, &self.scratch[..len]);
        self.residual = framed.residual;

        // Once shutdown interrupts a reply, remaining packets are still
        // logged but no longer answered.
        let mut replying = true;
        for packet in framed.packets {
            self.transition(ConnState::PacketReady);

            let contents = self
                .store
                .append_and_read(&packet)
                .await
                .map_err(CloseReason::Store)?;

            if replying {
                replying = self.send_reply(&contents).await?;
            }
            self.transition(ConnState::Receiving);
        }

        if replying {
            Ok(())
        } else {
            Err(CloseReason::Shutdown)
        }
    }

    /// Write the whole log back to the peer.
    ///
    /// Returns `Ok(false)` if shutdown interrupted the write.
    async fn send_reply(&mut self, contents: &Bytes) -> Result<bool, CloseReason> {
        tokio::select! {
            biased;
            res = self.stream.write_all(contents) => {
                res.map_err(CloseReason::SendFailed)?;
                trace!(peer = %self.peer, bytes = contents.len(), "Sent log contents");
                Ok(true)
            }
            _ = self.shutdown.wait() => {
                warn!(peer = %self.peer, "Reply abandoned for shutdown");
                Ok(false)
            }
        }
    }

    fn transition(&mut self, next: ConnState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }
}
