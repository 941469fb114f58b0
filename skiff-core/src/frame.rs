//! Framing: 4-byte big-endian length prefix + payload, pooled 4 KiB buffers.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy-loop buffer size, shared by framing and file transfers.
pub const BUFFER_SIZE: usize = 4 * 1024;

const LEN_SIZE: usize = 4;
/// Idle buffers kept around beyond this count are dropped.
const MAX_POOLED: usize = 32;

/// Error reading or writing a single length-prefixed frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("declared frame of {declared} bytes exceeds limit of {max}")]
    TooLarge { declared: u32, max: u32 },
    #[error("stream closed before the frame was complete")]
    Truncated,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pool of fixed-size byte buffers shared by every component that copies
/// payloads through a stream.
#[derive(Clone, Default)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a `BUFFER_SIZE` buffer, reusing an idle one when available.
    pub fn take(&self) -> Vec<u8> {
        let reused = match self.free.lock() {
            Ok(mut free) => free.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        reused.unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    /// Return a buffer to the pool. Buffers of the wrong size are dropped.
    pub fn restore(&self, buf: Vec<u8>) {
        if buf.len() != BUFFER_SIZE {
            return;
        }
        let mut free = match self.free.lock() {
            Ok(free) => free,
            Err(poisoned) => poisoned.into_inner(),
        };
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }
}

/// Write one frame: 4-byte big-endian length, then the bytes, copied through
/// a pooled buffer.
pub async fn write_length_prefixed<W>(
    writer: &mut W,
    bytes: &[u8],
    pool: &BufferPool,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    let mut buf = pool.take();
    let mut written = 0usize;
    while written < bytes.len() {
        let n = (bytes.len() - written).min(buf.len());
        buf[..n].copy_from_slice(&bytes[written..written + n]);
        if let Err(error) = writer.write_all(&buf[..n]).await {
            pool.restore(buf);
            return Err(FrameError::Io(error));
        }
        written += n;
    }
    pool.restore(buf);
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A declared length above `max_len` fails with `TooLarge`
/// without consuming any payload bytes; a stream that closes early fails
/// with `Truncated`.
pub async fn read_length_prefixed<R>(
    reader: &mut R,
    max_len: u32,
    pool: &BufferPool,
) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_truncated)?;
    let declared = u32::from_be_bytes(len_buf);
    if declared > max_len {
        return Err(FrameError::TooLarge {
            declared,
            max: max_len,
        });
    }
    let mut out = Vec::with_capacity(declared as usize);
    let mut buf = pool.take();
    let mut remaining = declared as usize;
    while remaining > 0 {
        let n = remaining.min(buf.len());
        if let Err(error) = reader.read_exact(&mut buf[..n]).await {
            pool.restore(buf);
            return Err(eof_as_truncated(error));
        }
        out.extend_from_slice(&buf[..n]);
        remaining -= n;
    }
    pool.restore(buf);
    Ok(out)
}

fn eof_as_truncated(error: std::io::Error) -> FrameError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(error)
    }
}
