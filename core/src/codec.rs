//! Length-prefixed record streams.
//!
//! Every record is an unsigned LEB128 length followed by the bincode body.
//! Journals, manifests and ledgers all share this framing, so a file can be
//! appended to and still decode as one continuous stream.

use crate::fsutil;
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Largest body accepted by the decoder. Anything bigger is corruption.
pub const MAX_RECORD_SIZE: u64 = 64 * 1024 * 1024;
const MAX_VARINT_LEN: usize = 10;
const READ_BUFFER_SIZE: usize = 64 * 1024;

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

#[derive(Debug, PartialEq, Eq)]
enum Varint {
    Complete { value: u64, len: usize },
    Incomplete,
    Overflow,
}

fn decode_varint(buf: &[u8]) -> Varint {
    let mut value = 0u64;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        let bits = (byte & 0x7f) as u64;
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Varint::Overflow;
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Varint::Complete { value, len: i + 1 };
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Varint::Overflow
    } else {
        Varint::Incomplete
    }
}

pub fn encode_record<T: Serialize + ?Sized>(record: &T, out: &mut Vec<u8>) -> Result<()> {
    let body = bincode::serialize(record)?;
    encode_varint(body.len() as u64, out);
    out.extend_from_slice(&body);
    Ok(())
}

/// Push-style decoder. Bytes of an unfinished record stay buffered until the
/// rest arrives; only complete records are ever returned.
#[derive(Debug)]
pub struct RecordDecoder<T> {
    buffer: Vec<u8>,
    position: usize,
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RecordDecoder<T> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Decoder whose reported offsets start at `offset`, for resuming a
    /// stream part way through.
    pub fn starting_at(offset: u64) -> Self {
        Self {
            buffer: Vec::new(),
            position: 0,
            offset,
            _marker: PhantomData,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.position > 0 {
            self.buffer.drain(..self.position);
            self.offset += self.position as u64;
            self.position = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete record and its byte offset in the stream, or `None` when
    /// more bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<(u64, T)>> {
        let pending = &self.buffer[self.position..];
        let record_offset = self.offset + self.position as u64;

        let (length, header_len) = match decode_varint(pending) {
            Varint::Complete { value, len } => (value, len),
            Varint::Incomplete => return Ok(None),
            Varint::Overflow => {
                return Err(Error::Decode {
                    offset: record_offset,
                    reason: "length header overflows u64".to_string(),
                });
            }
        };
        if length > MAX_RECORD_SIZE {
            return Err(Error::Decode {
                offset: record_offset,
                reason: format!("record length {} exceeds {}", length, MAX_RECORD_SIZE),
            });
        }

        let end = header_len + length as usize;
        if pending.len() < end {
            return Ok(None);
        }

        let record = bincode::deserialize(&pending[header_len..end]).map_err(|e| Error::Decode {
            offset: record_offset,
            reason: e.to_string(),
        })?;
        self.position += end;
        Ok(Some((record_offset, record)))
    }

    /// Buffers `bytes` and iterates the records that became complete.
    pub fn feed<'a>(&'a mut self, bytes: &[u8]) -> Records<'a, T> {
        self.push(bytes);
        Records {
            decoder: self,
            failed: false,
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// Call once no further bytes will arrive.
    pub fn finish(&self) -> Result<()> {
        match self.pending_bytes() {
            0 => Ok(()),
            remaining => Err(Error::Truncated {
                offset: self.offset + self.position as u64,
                remaining,
            }),
        }
    }
}

impl<T: DeserializeOwned> Default for RecordDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Records<'a, T> {
    decoder: &'a mut RecordDecoder<T>,
    failed: bool,
}

impl<T: DeserializeOwned> Iterator for Records<'_, T> {
    type Item = Result<(u64, T)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decoder.decode_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Streams records out of any async reader.
pub struct RecordReader<R, T> {
    reader: R,
    decoder: RecordDecoder<T>,
    buffer: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin, T: DeserializeOwned> RecordReader<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: RecordDecoder::new(),
            buffer: vec![0u8; READ_BUFFER_SIZE],
            eof: false,
        }
    }

    pub async fn next(&mut self) -> Result<Option<(u64, T)>> {
        loop {
            if let Some(record) = self.decoder.decode_next()? {
                return Ok(Some(record));
            }
            if self.eof {
                self.decoder.finish()?;
                return Ok(None);
            }
            let n = self.reader.read(&mut self.buffer).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.decoder.push(&self.buffer[..n]);
            }
        }
    }

    pub async fn read_all(mut self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        while let Some((_, record)) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}

impl<T: DeserializeOwned> RecordReader<File, T> {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(File::open(path).await?))
    }
}

pub struct RecordWriter<W: AsyncWrite + Unpin> {
    writer: BufWriter<W>,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            scratch: Vec::new(),
        }
    }

    pub async fn write<T: Serialize + ?Sized>(&mut self, record: &T) -> Result<()> {
        self.scratch.clear();
        encode_record(record, &mut self.scratch)?;
        self.writer.write_all(&self.scratch).await?;
        Ok(())
    }

    /// Writes records as the iterator yields them; nothing is collected.
    pub async fn write_all<T, I>(&mut self, records: I) -> Result<u64>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let mut written = 0;
        for record in records {
            self.write(&record).await?;
            written += 1;
        }
        Ok(written)
    }

    pub async fn finish(mut self) -> Result<W> {
        self.writer.flush().await?;
        Ok(self.writer.into_inner())
    }
}

impl RecordWriter<File> {
    pub async fn create(path: &Path) -> Result<Self> {
        Ok(Self::new(File::create(path).await?))
    }

    /// Continues an existing stream; the result decodes as one sequence.
    pub async fn append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(file))
    }

    /// Flushes and fsyncs.
    pub async fn sync(self) -> Result<()> {
        let file = self.finish().await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Replaces `path` with the given records in one atomic step.
pub async fn write_records_atomic<T, I>(path: &Path, records: I) -> Result<u64>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let (file, temp) = fsutil::temp_file_for(path).await?;
    let mut writer = RecordWriter::new(file);
    let written = writer.write_all(records).await?;
    let file = writer.finish().await?;
    fsutil::commit(file, temp, path).await?;
    Ok(written)
}
