//! Reusable byte buffers for streaming blob content
//!
//! Each transfer borrows one buffer for the lifetime of a copy; the buffer is
//! handed back to the pool when the [`PooledBuffer`] guard drops, including on
//! early returns and errors.

use crate::error::{PusherError, Result};
use std::io::{ErrorKind, Read, Write};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Size of each pooled buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of bytes sent per chunked upload request.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Idle buffers kept around; extra buffers are dropped on release.
const DEFAULT_MAX_IDLE: usize = 64;

#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Self::with_capacity(buffer_size, DEFAULT_MAX_IDLE)
    }

    pub fn with_capacity(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(1),
            max_idle,
            idle: Mutex::new(Vec::new()),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Borrow a zeroed buffer of `buffer_size` bytes.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let buf = reused.unwrap_or_else(|| vec![0u8; self.buffer_size]);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.len() != self.buffer_size {
            buf.resize(self.buffer_size, 0);
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(buf);
            }
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Copy `reader` into `writer` through a pooled buffer, returning the byte
/// count. The token is checked before each read, so a cancelled copy stops
/// within one buffer.
pub fn copy_buffered<R, W>(
    pool: &Arc<BufferPool>,
    cancel: &CancellationToken,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = pool.get();
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(PusherError::Cancelled);
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        writer.write_all(&buf[..n])?;
        written += n as u64;
    }

    writer.flush()?;
    Ok(written)
}
