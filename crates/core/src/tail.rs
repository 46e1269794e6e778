use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Result of one [`FileTail::read_chunk`] call.
#[derive(Debug, Default)]
pub struct TailRead {
    /// Newly appended bytes. Empty when the reader has caught up.
    pub bytes: Vec<u8>,
    /// The file shrank below the stored offset and reading restarted at 0.
    /// Callers must drop any partial record they were holding.
    pub reset: bool,
}

/// Byte-offset reader over an append-only file.
///
/// Each call reopens the file, so a file that is replaced on disk is picked
/// up on the next read. Only bytes past the stored offset are returned.
#[derive(Debug)]
pub struct FileTail {
    path: PathBuf,
    offset: u64,
    chunk: usize,
}

impl FileTail {
    pub fn new(path: impl Into<PathBuf>, chunk: usize) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            chunk: chunk.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read up to one chunk of appended bytes and advance the offset.
    pub async fn read_chunk(&mut self) -> io::Result<TailRead> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let file_len = file.metadata().await?.len();

        let mut reset = false;
        if self.offset > file_len {
            tracing::warn!(
                path = %self.path.display(),
                old_offset = self.offset,
                new_file_len = file_len,
                "File shrank below read offset; restarting from the beginning"
            );
            self.offset = 0;
            reset = true;
        }
        if self.offset == file_len {
            return Ok(TailRead {
                bytes: Vec::new(),
                reset,
            });
        }

        let to_read = (file_len - self.offset).min(self.chunk as u64) as usize;
        file.seek(io::SeekFrom::Start(self.offset)).await?;
        let mut bytes = vec![0u8; to_read];
        let n = read_fully(&mut file, &mut bytes).await?;
        bytes.truncate(n);
        self.offset += n as u64;

        Ok(TailRead { bytes, reset })
    }
}

/// Like `read_exact`, but a file truncated mid-read yields a short count
/// instead of `UnexpectedEof`.
async fn read_fully(file: &mut tokio::fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
