//! Splits a byte source into ordered, bounded-size chunks.
//!
//! Chunks are read into a pooled buffer and lent out one at a time, so a
//! caller holds at most one chunk of a transfer in memory.

use crate::services::buffer_pool::{BufferPool, PooledBuffer};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("declared length {declared} does not match observed length {observed}")]
    LengthMismatch { declared: u64, observed: u64 },
    #[error("failed to read upload stream: {0}")]
    Io(#[from] io::Error),
    #[error("chunk buffer pool is closed")]
    PoolClosed,
}

/// One slice of the source, borrowed from the splitter's buffer.
#[derive(Debug)]
pub struct Chunk<'a> {
    pub order: i64,
    pub data: &'a [u8],
}

/// Number of chunks a source of `total_size` bytes produces.
pub fn chunk_count(total_size: u64, chunk_size: usize) -> u64 {
    total_size.div_ceil(chunk_size as u64)
}

/// Lazy chunk sequence over an [`AsyncRead`].
///
/// With a declared length, the source must yield exactly that many bytes;
/// short or overlong sources fail with [`SplitError::LengthMismatch`] before
/// the final chunk is handed out. Without one, the source is read until EOF
/// and a short final read is simply the last chunk.
pub struct ChunkSplitter<R> {
    reader: R,
    buf: PooledBuffer,
    declared: Option<u64>,
    consumed: u64,
    next_order: i64,
    finished: bool,
}

impl<R> ChunkSplitter<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn new(
        reader: R,
        pool: &BufferPool,
        declared: Option<u64>,
    ) -> Result<Self, SplitError> {
        let buf = pool.acquire().await.map_err(|_| SplitError::PoolClosed)?;
        Ok(Self {
            reader,
            buf,
            declared,
            consumed: 0,
            next_order: 0,
            finished: false,
        })
    }

    /// Bytes read from the source so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Read the next chunk. Returns `None` once the source is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk<'_>>, SplitError> {
        if self.finished {
            return Ok(None);
        }

        let capacity = self.buf.len();
        let want = match self.declared {
            Some(total) => (total - self.consumed).min(capacity as u64) as usize,
            None => capacity,
        };

        let filled = read_full(&mut self.reader, &mut self.buf[..want]).await?;
        self.consumed += filled as u64;

        match self.declared {
            Some(total) => {
                if filled < want {
                    return Err(SplitError::LengthMismatch {
                        declared: total,
                        observed: self.consumed,
                    });
                }
                if self.consumed == total {
                    let mut probe = [0u8; 1];
                    let extra = self.reader.read(&mut probe).await?;
                    if extra > 0 {
                        return Err(SplitError::LengthMismatch {
                            declared: total,
                            observed: self.consumed + extra as u64,
                        });
                    }
                    self.finished = true;
                }
            }
            None => {
                if filled < capacity {
                    self.finished = true;
                }
            }
        }

        if filled == 0 {
            return Ok(None);
        }

        let order = self.next_order;
        self.next_order += 1;
        Ok(Some(Chunk {
            order,
            data: &self.buf[..filled],
        }))
    }
}

/// Fill `buf` completely unless EOF comes first; returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use tokio_util::io::StreamReader;

    async fn split_all(
        data: &[u8],
        chunk_size: usize,
        declared: Option<u64>,
    ) -> Result<Vec<(i64, Vec<u8>)>, SplitError> {
        let pool = BufferPool::new(chunk_size, 1);
        let mut splitter = ChunkSplitter::new(data, &pool, declared).await?;
        let mut out = Vec::new();
        while let Some(chunk) = splitter.next_chunk().await? {
            out.push((chunk.order, chunk.data.to_vec()));
        }
        Ok(out)
    }

    #[tokio::test]
    async fn empty_source_yields_nothing() {
        assert!(split_all(b"", 4, None).await.unwrap().is_empty());
        assert!(split_all(b"", 4, Some(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exact_multiple_has_no_trailing_empty_chunk() {
        let chunks = split_all(b"abcdefgh", 4, None).await.unwrap();
        assert_eq!(
            chunks,
            vec![(0, b"abcd".to_vec()), (1, b"efgh".to_vec())]
        );
        let declared = split_all(b"abcdefgh", 4, Some(8)).await.unwrap();
        assert_eq!(declared.len(), 2);
    }

    #[tokio::test]
    async fn one_byte_overflow_makes_second_chunk() {
        let chunks = split_all(b"abcde", 4, Some(5)).await.unwrap();
        assert_eq!(chunks, vec![(0, b"abcd".to_vec()), (1, b"e".to_vec())]);
        assert_eq!(chunk_count(5, 4), 2);
    }

    #[tokio::test]
    async fn short_source_is_a_length_mismatch() {
        let err = split_all(b"abc", 4, Some(10)).await.unwrap_err();
        assert!(matches!(
            err,
            SplitError::LengthMismatch { declared: 10, observed: 3 }
        ));
    }

    #[tokio::test]
    async fn overlong_source_is_a_length_mismatch() {
        let err = split_all(b"abcdef", 4, Some(5)).await.unwrap_err();
        assert!(matches!(err, SplitError::LengthMismatch { declared: 5, .. }));
    }

    #[tokio::test]
    async fn streamed_source_with_ragged_reads() {
        let pieces: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"c")),
            Ok(Bytes::from_static(b"defg")),
            Ok(Bytes::from_static(b"h")),
        ];
        let reader = StreamReader::new(stream::iter(pieces));
        let pool = BufferPool::new(3, 1);
        let mut splitter = ChunkSplitter::new(reader, &pool, None).await.unwrap();
        let mut sizes = Vec::new();
        while let Some(chunk) = splitter.next_chunk().await.unwrap() {
            sizes.push(chunk.data.len());
        }
        assert_eq!(sizes, vec![3, 3, 2]);
        assert_eq!(splitter.consumed(), 8);
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 6), 0);
        assert_eq!(chunk_count(6, 6), 1);
        assert_eq!(chunk_count(7, 6), 2);
    }
}
