use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::Stream;
use md5::Context;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Read buffer used for hashing and streamed request bodies.
const READ_BUF: usize = 64 * 1024;

/// Windows hashed per pass when computing a whole-file checksum.
const CHECKSUM_WINDOW: u64 = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("window {offset}+{len} is outside a file of {file_len} bytes")]
    OutOfRange { offset: u64, len: u64, file_len: u64 },
}

/// Bounded-window access to a local file.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: Utf8PathBuf,
    len: u64,
}

impl ChunkReader {
    pub fn open(path: &Utf8Path) -> Result<Self, ChecksumError> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(ChecksumError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{path} is not a regular file"),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            len: meta.len(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), ChecksumError> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(ChecksumError::OutOfRange {
                offset,
                len,
                file_len: self.len,
            });
        }
        Ok(())
    }

    /// Read `[offset, offset + len)` into memory.
    pub fn read_window(&self, offset: u64, len: u64) -> Result<Vec<u8>, ChecksumError> {
        self.check_range(offset, len)?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf)?;
        if (buf.len() as u64) < len {
            return Err(ChecksumError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} shrank while reading", self.path),
            )));
        }
        Ok(buf)
    }

    /// `(offset, len)` pairs covering the file in windows of at most `window` bytes.
    pub fn windows(&self, window: u64) -> Vec<(u64, u64)> {
        let window = window.max(1);
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.len {
            let len = window.min(self.len - offset);
            out.push((offset, len));
            offset += len;
        }
        out
    }

    /// Stream `[offset, offset + len)` without loading it into memory.
    pub async fn window_stream(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<impl Stream<Item = std::io::Result<Bytes>> + Send + 'static, ChecksumError> {
        self.check_range(offset, len)?;
        let mut file = tokio::fs::File::open(self.path.as_std_path()).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(ReaderStream::with_capacity(file.take(len), READ_BUF))
    }

    /// MD5 over the whole file, read one window at a time.
    pub fn checksum(&self) -> Result<String, ChecksumError> {
        let file = File::open(&self.path)?;
        let mut reader = std::io::BufReader::with_capacity(READ_BUF, file);
        let mut hasher = Context::new();
        let mut buf = vec![0u8; READ_BUF];
        let mut hashed = 0u64;

        loop {
            let mut window = reader.by_ref().take(CHECKSUM_WINDOW);
            let mut copied = 0u64;
            loop {
                let n = window.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.consume(&buf[..n]);
                copied += n as u64;
            }
            hashed += copied;
            if copied == 0 {
                break;
            }
        }

        tracing::debug!("hashed {hashed} bytes of {}", self.path);
        Ok(format!("MD5:{:x}", hasher.finalize()))
    }
}

/// Compute the content checksum string for a file (`MD5:<hex>`).
pub fn file_checksum(path: &Utf8Path) -> Result<String, ChecksumError> {
    ChunkReader::open(path)?.checksum()
}
