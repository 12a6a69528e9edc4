//! Bounded pool of reusable chunk buffers.
//!
//! At most `max_buffers` buffers are lent out at once; a caller asking for
//! more waits until one is returned. Returned buffers are kept for the next
//! request instead of being reallocated.

use parking_lot::Mutex;
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    idle: Mutex<Vec<Vec<u8>>>,
    permits: Arc<Semaphore>,
    buffer_size: usize,
    max_buffers: usize,
}

/// Snapshot of pool utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub available: usize,
    pub max_buffers: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        let max_buffers = max_buffers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_buffers)),
                permits: Arc::new(Semaphore::new(max_buffers)),
                buffer_size,
                max_buffers,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Borrow a buffer of exactly `buffer_size` bytes.
    ///
    /// The contents are whatever the previous borrower left behind.
    pub async fn acquire(&self) -> Result<PooledBuffer, AcquireError> {
        let permit = self.inner.permits.clone().acquire_owned().await?;
        let buf = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);

        Ok(PooledBuffer {
            buf: Some(buf),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle.lock().len(),
            available: self.inner.permits.available_permits(),
            max_buffers: self.inner.max_buffers,
        }
    }
}

/// RAII guard returning its buffer to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut idle = self.pool.idle.lock();
            if idle.len() < self.pool.max_buffers {
                idle.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn buffers_are_reused() {
        let pool = BufferPool::new(16, 2);
        {
            let mut buf = pool.acquire().await.unwrap();
            assert_eq!(buf.len(), 16);
            buf[0] = 42;
        }
        assert_eq!(pool.stats().idle, 1);

        let buf = pool.acquire().await.unwrap();
        assert_eq!(buf[0], 42);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn acquire_waits_when_exhausted() {
        let pool = BufferPool::new(8, 1);
        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().available, 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(again.is_ok());
    }
}
