//! Append-only packet log backed by a single flat file.
//!
//! All connections share one `LogStore`. Every operation takes the same
//! lock, and `append_and_read` holds it across both halves so a reply
//! always includes the packet that produced it and never observes a
//! half-written append from another connection.

use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// How an existing file is treated when the store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Keep any stale contents and append after them.
    Reuse,
    /// Discard stale contents.
    Truncate,
}

/// Counters for the current process lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Packets appended since the store was opened.
    pub packets: u64,
    /// Bytes appended since the store was opened.
    pub bytes_appended: u64,
    /// Current size of the backing file.
    pub size: u64,
}

/// Shared packet log.
pub struct LogStore {
    path: PathBuf,
    fsync: bool,
    state: Mutex<LogStats>,
}

impl LogStore {
    /// Create the backing file if missing, applying `mode` to stale contents.
    pub async fn open(
        path: impl Into<PathBuf>,
        mode: OpenMode,
        fsync: bool,
    ) -> Result<Self, StoreError> {
        let path = path.into();

        let file = OpenOptions::new()
            .create(true)
            .append(mode == OpenMode::Reuse)
            .write(true)
            .truncate(mode == OpenMode::Truncate)
            .open(&path)
            .await
            .map_err(|e| StoreError::Open(path.clone(), e))?;

        let size = file
            .metadata()
            .await
            .map_err(|e| StoreError::Open(path.clone(), e))?
            .len();

        if size > 0 {
            warn!(
                path = %path.display(),
                size,
                "Reusing stale packet log from a previous run"
            );
        }

        info!(path = %path.display(), ?mode, fsync, "Opened packet log");

        Ok(Self {
            path,
            fsync,
            state: Mutex::new(LogStats {
                size,
                ..LogStats::default()
            }),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `packet` to the end of the log.
    #[allow(dead_code)]
    pub async fn append(&self, packet: &[u8]) -> Result<(), StoreError> {
        let mut stats = self.state.lock().await;
        self.append_locked(&mut stats, packet).await
    }

    /// Read the whole log from start to end.
    #[allow(dead_code)]
    pub async fn read_all(&self) -> Result<Bytes, StoreError> {
        let _stats = self.state.lock().await;
        self.read_locked().await
    }

    /// Append `packet`, then read the whole log, as one critical section.
    ///
    /// The result always ends with `packet`.
    pub async fn append_and_read(&self, packet: &[u8]) -> Result<Bytes, StoreError> {
        let mut stats = self.state.lock().await;
        self.append_locked(&mut stats, packet).await?;
        self.read_locked().await
    }

    /// Counters for this run.
    pub async fn stats(&self) -> LogStats {
        *self.state.lock().await
    }

    /// Delete the backing file.
    ///
    /// Returns `Ok(false)` if there was nothing to delete.
    pub async fn reset(&self) -> Result<bool, StoreError> {
        let _stats = self.state.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed packet log");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Packet log already absent");
                Ok(false)
            }
            Err(e) => Err(StoreError::Remove(self.path.clone(), e)),
        }
    }

    async fn append_locked(&self, stats: &mut LogStats, packet: &[u8]) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::Append(self.path.clone(), e))?;

        let start_len = file
            .metadata()
            .await
            .map_err(|e| StoreError::Append(self.path.clone(), e))?
            .len();

        let result = async {
            let mut written = 0;
            while written < packet.len() {
                match file.write(&packet[written..]).await {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => written += n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            // tokio::fs::File completes writes in the background until flushed.
            file.flush().await?;
            if self.fsync {
                file.sync_data().await?;
            }
            Ok::<(), io::Error>(())
        }
        .await;

        if let Err(e) = result {
            self.rollback(&mut file, start_len).await;
            return Err(StoreError::Append(self.path.clone(), e));
        }

        stats.packets += 1;
        stats.bytes_appended += packet.len() as u64;
        stats.size = start_len + packet.len() as u64;
        trace!(len = packet.len(), size = stats.size, "Appended packet");
        Ok(())
    }

    /// Cut a torn append back to the last complete packet.
    async fn rollback(&self, file: &mut fs::File, len: u64) {
        // A failed write may still be pending inside the file handle.
        let _ = file.flush().await;
        if let Err(e) = file.set_len(len).await {
            error!(
                path = %self.path.display(),
                len,
                error = %e,
                "Failed to roll back partial append"
            );
        }
    }

    async fn read_locked(&self) -> Result<Bytes, StoreError> {
        let mut file = fs::File::open(&self.path)
            .await
            .map_err(|e| StoreError::Read(self.path.clone(), e))?;

        let hint = file
            .metadata()
            .await
            .map(|m| m.len() as usize)
            .unwrap_or(0);

        let mut contents = Vec::with_capacity(hint);
        file.read_to_end(&mut contents)
            .await
            .map_err(|e| StoreError::Read(self.path.clone(), e))?;

        Ok(Bytes::from(contents))
    }
}

/// Packet log errors
#[derive(Debug)]
pub enum StoreError {
    Open(PathBuf, io::Error),
    Append(PathBuf, io::Error),
    Read(PathBuf, io::Error),
    Remove(PathBuf, io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Open(path, e) => {
                write!(f, "Failed to open packet log '{}': {}", path.display(), e)
            }
            StoreError::Append(path, e) => {
                write!(f, "Failed to append to packet log '{}': {}", path.display(), e)
            }
            StoreError::Read(path, e) => {
                write!(f, "Failed to read packet log '{}': {}", path.display(), e)
            }
            StoreError::Remove(path, e) => {
                write!(f, "Failed to remove packet log '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Open(_, e)
            | StoreError::Append(_, e)
            | StoreError::Read(_, e)
            | StoreError::Remove(_, e) => Some(e),
        }
    }
}

/// Unique scratch path for tests that touch the filesystem.
#[cfg(test)]
pub(crate) fn temp_log_path(tag: &str) -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "packet-log-{tag}-{}-{n}.data",
        std::process::id()
    ))
}
