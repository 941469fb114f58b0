//! Transfer engine: move one file's bytes over N parallel TCP connections,
//! each owning a disjoint byte range of the destination.

use std::future::Future;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::frame::{read_length_prefixed, write_length_prefixed, BufferPool, FrameError};
use crate::model::{digest_file, FileDigest};

/// Default number of parallel range connections.
pub const DEFAULT_CONNECTIONS: u32 = 4;
/// Staleness bound for each socket operation. The original protocol left
/// this open; 30 s catches a hung range without tripping on slow links.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest range-request document accepted by the server.
const MAX_REQUEST_FRAME: u32 = 64 * 1024;

/// A contiguous byte interval `[start, end)` of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split `[0, size)` into at most `connections` contiguous ranges, as even
/// as possible; the last range absorbs the remainder.
pub fn partition_ranges(size: u64, connections: u32) -> Vec<Range> {
    if size == 0 || connections == 0 {
        return Vec::new();
    }
    let count = (connections as u64).min(size);
    let base = size / count;
    let mut out = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for i in 0..count {
        let end = if i == count - 1 { size } else { start + base };
        out.push(Range { start, end });
        start = end;
    }
    out
}

/// First and only frame on a transfer connection: which file version and
/// which range the connection will carry. The response is the raw bytes of
/// the range, with no further framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeRequest {
    pub file: FileDigest,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer connection failed: {0}")]
    Connect(std::io::Error),
    #[error("i/o error during transfer: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed range request: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("range {start}..{end} stalled past the i/o timeout")]
    Timeout { start: u64, end: u64 },
    #[error("content hash mismatch after download")]
    IntegrityMismatch,
    #[error("transfer cancelled")]
    Cancelled,
}

/// Host-owned content reads, invoked by the server side to fill ranges.
pub trait ContentSource: Send + Sync + 'static {
    /// Read file bytes at `offset` into `buf`; returns bytes read, 0 at EOF.
    fn read_at(
        &self,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> impl Future<Output = std::io::Result<usize>> + Send;
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub connections: u32,
    /// Re-hash the assembled file and compare against the expected digest.
    pub verify: bool,
    pub io_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connections: DEFAULT_CONNECTIONS,
            verify: true,
            io_timeout: IO_TIMEOUT,
        }
    }
}

/// Shared state of one download, mutated concurrently by every range task.
/// The cancel flag is checked between buffer-sized reads, so cancellation
/// latency is bounded by one buffer transfer.
#[derive(Debug, Default)]
pub struct TransferSession {
    total_downloaded: AtomicU64,
    cancelled: AtomicBool,
}

impl TransferSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }
}

/// Progress window owned by exactly one range task.
struct ConnectionProgress {
    range: Range,
    bytes_received: u64,
}

/// Serve range requests: one request per inbound connection, answered with
/// the raw bytes read from the host's content source.
pub struct TransferServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TransferServer {
    pub async fn bind<S: ContentSource>(addr: SocketAddr, source: S) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let accept_task = tokio::spawn(accept_loop(listener, Arc::new(source)));
        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TransferServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop<S: ContentSource>(listener: TcpListener, source: Arc<S>) {
    let pool = BufferPool::new();
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let source = source.clone();
                let pool = pool.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve_range(stream, source, pool).await {
                        tracing::warn!(
                            event = "transfer_serve_failed",
                            remote = %remote,
                            error = %error
                        );
                    }
                });
            }
            Err(error) => {
                tracing::warn!(event = "transfer_accept_failed", error = %error);
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }
}

async fn serve_range<S: ContentSource>(
    mut stream: TcpStream,
    source: Arc<S>,
    pool: BufferPool,
) -> Result<(), TransferError> {
    let request_bytes = read_length_prefixed(&mut stream, MAX_REQUEST_FRAME, &pool).await?;
    let request: RangeRequest = serde_json::from_slice(&request_bytes)?;
    let path = request.file.file.path.as_str();

    let mut buf = pool.take();
    let mut offset = request.start;
    while offset < request.end {
        let want = ((request.end - offset) as usize).min(buf.len());
        let n = match source.read_at(path, offset, &mut buf[..want]).await {
            Ok(n) => n,
            Err(error) => {
                pool.restore(buf);
                return Err(TransferError::Io(error));
            }
        };
        if n == 0 {
            // Source shorter than advertised; the client sees a short range.
            break;
        }
        let write = timeout(IO_TIMEOUT, stream.write_all(&buf[..n])).await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                pool.restore(buf);
                return Err(TransferError::Io(error));
            }
            Err(_) => {
                pool.restore(buf);
                return Err(TransferError::Timeout {
                    start: request.start,
                    end: request.end,
                });
            }
        }
        offset += n as u64;
    }
    pool.restore(buf);
    stream.flush().await?;
    Ok(())
}

/// Download one file version from `remote` into `destination` over parallel
/// range connections. Progress fires after every buffer-sized chunk with
/// `(total downloaded, file size)`. A failed or cancelled download leaves
/// the destination in an undefined state.
pub async fn download<F>(
    remote: SocketAddr,
    target: &FileDigest,
    destination: &Path,
    config: &TransferConfig,
    session: &Arc<TransferSession>,
    progress: F,
) -> Result<(), TransferError>
where
    F: Fn(u64, u64) + Send + Sync + 'static,
{
    let size = target.file.size;
    let ranges = partition_ranges(size, config.connections.max(1));

    // Pre-size the destination so every task writes at its own offset with
    // no coordination.
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)
            .await?;
        file.set_len(size).await?;
    }

    let progress = Arc::new(progress);
    let pool = BufferPool::new();
    let mut tasks = Vec::with_capacity(ranges.len());
    for range in ranges {
        let request = RangeRequest {
            file: target.clone(),
            start: range.start,
            end: range.end,
        };
        tasks.push(tokio::spawn(download_range(
            remote,
            request,
            destination.to_path_buf(),
            config.io_timeout,
            session.clone(),
            progress.clone(),
            pool.clone(),
            size,
        )));
    }

    let mut failure: Option<TransferError> = None;
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                if failure.is_none() {
                    failure = Some(error);
                }
            }
            Err(join_error) => {
                if failure.is_none() {
                    failure = Some(TransferError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        join_error,
                    )));
                }
            }
        }
    }

    // Cancellation wins over secondary per-range errors.
    if session.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    if let Some(error) = failure {
        return Err(error);
    }

    if config.verify {
        let actual = digest_file(destination).await?;
        if actual != target.content_hash {
            return Err(TransferError::IntegrityMismatch);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn download_range<F>(
    remote: SocketAddr,
    request: RangeRequest,
    destination: PathBuf,
    io_timeout: Duration,
    session: Arc<TransferSession>,
    progress: Arc<F>,
    pool: BufferPool,
    total_size: u64,
) -> Result<(), TransferError>
where
    F: Fn(u64, u64) + Send + Sync + 'static,
{
    let range = Range {
        start: request.start,
        end: request.end,
    };
    let mut stream = TcpStream::connect(remote)
        .await
        .map_err(TransferError::Connect)?;
    let request_bytes = serde_json::to_vec(&request)?;
    write_length_prefixed(&mut stream, &request_bytes, &pool).await?;

    let mut file = OpenOptions::new().write(true).open(&destination).await?;
    file.seek(SeekFrom::Start(range.start)).await?;

    let mut connection = ConnectionProgress {
        range,
        bytes_received: 0,
    };
    let mut buf = pool.take();
    while connection.bytes_received < connection.range.len() {
        if session.is_cancelled() {
            pool.restore(buf);
            return Err(TransferError::Cancelled);
        }
        let want = ((connection.range.len() - connection.bytes_received) as usize).min(buf.len());
        let n = match timeout(io_timeout, stream.read(&mut buf[..want])).await {
            Ok(Ok(n)) => n,
            Ok(Err(error)) => {
                pool.restore(buf);
                return Err(TransferError::Io(error));
            }
            Err(_) => {
                pool.restore(buf);
                return Err(TransferError::Timeout {
                    start: range.start,
                    end: range.end,
                });
            }
        };
        if n == 0 {
            pool.restore(buf);
            return Err(TransferError::Frame(FrameError::Truncated));
        }
        file.write_all(&buf[..n]).await?;
        connection.bytes_received += n as u64;
        let downloaded = session
            .total_downloaded
            .fetch_add(n as u64, Ordering::Relaxed)
            + n as u64;
        progress(downloaded, total_size);
    }
    file.flush().await?;
    pool.restore(buf);
    Ok(())
}
