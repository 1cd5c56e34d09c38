use crate::Digest;
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Splits a byte stream into fixed-size chunks. Boundaries depend only on
/// length, so an insertion shifts every following chunk.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn reader<R: AsyncRead + Unpin>(&self, reader: R) -> ChunkReader<R> {
        ChunkReader {
            reader,
            chunk_size: self.chunk_size,
            offset: 0,
            whole: blake3::Hasher::new(),
            done: false,
        }
    }

    /// Hashes a whole stream without keeping chunk payloads around.
    pub async fn hash_stream<R: AsyncRead + Unpin>(&self, reader: R) -> io::Result<FileDigests> {
        let mut chunks = self.reader(reader);
        let mut list = Vec::new();
        while let Some(chunk) = chunks.next_chunk().await? {
            list.push(ChunkDigest {
                digest: chunk.digest,
                size: chunk.data.len() as u64,
            });
        }
        Ok(FileDigests {
            digest: chunks.finish(),
            chunks: list,
        })
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub digest: Digest,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDigest {
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub digest: Digest,
    pub chunks: Vec<ChunkDigest>,
}

/// Pull-based chunk iterator over one file's stream.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    whole: blake3::Hasher,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub async fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.reader.read(&mut buffer[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buffer.truncate(filled);

        self.whole.update(&buffer);
        let chunk = Chunk {
            offset: self.offset,
            digest: Digest::from_data(&buffer),
            data: Bytes::from(buffer),
        };
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    /// Digest of every byte read so far, in read order.
    pub fn finish(self) -> Digest {
        Digest::from(self.whole.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    #[tokio::test]
    async fn test_fixed_boundaries_with_short_tail() {
        let chunker = Chunker::new(1024);
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let digests = chunker.hash_stream(&data[..]).await.unwrap();

        let sizes: Vec<u64> = digests.chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);
        assert_eq!(digests.chunks[0].digest, Digest::from_data(&data[..1024]));
        assert_eq!(digests.chunks[2].digest, Digest::from_data(&data[2048..]));
        assert_eq!(digests.digest, Digest::from_data(&data));
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let chunker = Chunker::new(100);
        let data = vec![7u8; 300];
        let digests = chunker.hash_stream(&data[..]).await.unwrap();
        assert_eq!(digests.chunks.len(), 3);
        assert!(digests.chunks.iter().all(|c| c.size == 100));
    }

    #[tokio::test]
    async fn test_empty_stream_has_no_chunks() {
        let chunker = Chunker::new(64);
        let digests = chunker.hash_stream(&b""[..]).await.unwrap();
        assert!(digests.chunks.is_empty());
        assert_eq!(digests.digest, Digest::from_data(b""));
    }

    #[tokio::test]
    async fn test_hashing_is_deterministic() {
        let chunker = Chunker::new(333);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let first = chunker.hash_stream(&data[..]).await.unwrap();
        let second = chunker.hash_stream(&data[..]).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_insertion_shifts_following_chunks() {
        let chunker = Chunker::new(16);
        let data = (0..64u8).collect::<Vec<_>>();
        let mut shifted = vec![0xff];
        shifted.extend_from_slice(&data);

        let a = chunker.hash_stream(&data[..]).await.unwrap();
        let b = chunker.hash_stream(&shifted[..]).await.unwrap();
        assert!(a.chunks.iter().all(|c| !b.chunks.contains(c)));
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                Poll::Ready(Err(io::Error::other("device went away")))
            } else {
                self.served = true;
                let n = buf.remaining().min(10);
                buf.put_slice(&[1u8; 10][..n]);
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn test_read_failure_yields_no_digests() {
        let chunker = Chunker::new(4);
        let result = chunker.hash_stream(FailingReader { served: false }).await;
        assert!(result.is_err());
    }
}
