//! Outgoing file chunking
//!
//! Reads a source sequentially and cuts it into chunks, tracking how many
//! bytes went into the current partition.

use std::fmt;
use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::TransferError;
use super::TransferConfig;

/// MIME type used when none is known
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// A file queued for sending
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    source: Box<dyn AsyncRead + Send + Sync + Unpin>,
}

impl OutgoingFile {
    /// File backed by an arbitrary reader of `size` bytes
    pub fn new(
        name: impl Into<String>,
        mime: impl Into<String>,
        size: u64,
        source: impl AsyncRead + Send + Sync + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            size,
            source: Box::new(source),
        }
    }

    /// In-memory file
    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let size = data.len() as u64;
        Self::new(name, mime, size, Cursor::new(data))
    }

    /// Open a file on disk
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let mime = guess_mime(&name).to_string();
        Ok(Self::new(name, mime, size, file))
    }
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// MIME type from a file extension
pub fn guess_mime(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => DEFAULT_MIME,
    }
}

/// Cuts one outgoing file into chunks and partitions
pub struct FileChunker {
    source: Box<dyn AsyncRead + Send + Sync + Unpin>,
    size: u64,
    chunk_size: usize,
    partition_size: u64,
    offset: u64,
    partition_bytes: u64,
}

impl FileChunker {
    /// Start chunking `file` from its first byte
    pub fn new(file: OutgoingFile, config: &TransferConfig) -> Self {
        Self {
            source: file.source,
            size: file.size,
            chunk_size: config.chunk_size,
            partition_size: config.partition_size,
            offset: 0,
            partition_bytes: 0,
        }
    }

    /// Read the next chunk, or `None` once the declared size was read
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        if self.is_file_end() {
            return Ok(None);
        }

        let want = (self.size - self.offset).min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.source.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransferError::Truncated {
                    expected: self.size,
                    got: self.offset + filled as u64,
                });
            }
            filled += n;
        }

        self.offset += want as u64;
        self.partition_bytes += want as u64;
        Ok(Some(Bytes::from(buf)))
    }

    /// True when the current partition is full
    pub fn is_partition_end(&self) -> bool {
        self.partition_bytes >= self.partition_size
    }

    /// Start a new partition after the receiver acknowledged the last one
    pub fn next_partition(&mut self) {
        self.partition_bytes = 0;
    }

    /// True when every declared byte was read
    pub fn is_file_end(&self) -> bool {
        self.offset >= self.size
    }

    /// Bytes read so far
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, partition_size: u64) -> TransferConfig {
        TransferConfig {
            chunk_size,
            partition_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_partition_ends_on_reaching_size() {
        let file = OutgoingFile::from_bytes("a.bin", DEFAULT_MIME, vec![7u8; 2_500_000]);
        let mut chunker = FileChunker::new(file, &config(64_000, 1_000_000));

        let mut chunks = 0;
        while !chunker.is_partition_end() {
            chunker.next_chunk().await.unwrap().unwrap();
            chunks += 1;
        }
        assert_eq!(chunks, 16);
        assert_eq!(chunker.offset(), 1_024_000);

        chunker.next_partition();
        assert!(!chunker.is_partition_end());
    }

    #[tokio::test]
    async fn test_last_chunk_is_short() {
        let file = OutgoingFile::from_bytes("a.bin", DEFAULT_MIME, vec![1u8; 10]);
        let mut chunker = FileChunker::new(file, &config(4, 100));

        let sizes: Vec<usize> = {
            let mut sizes = Vec::new();
            while let Some(chunk) = chunker.next_chunk().await.unwrap() {
                sizes.push(chunk.len());
            }
            sizes
        };
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(chunker.is_file_end());
    }

    #[tokio::test]
    async fn test_empty_file_has_no_chunks() {
        let file = OutgoingFile::from_bytes("empty", DEFAULT_MIME, Vec::new());
        let mut chunker = FileChunker::new(file, &TransferConfig::default());
        assert!(chunker.is_file_end());
        assert!(chunker.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_source_is_truncated() {
        let file = OutgoingFile::new("lies.bin", DEFAULT_MIME, 10, Cursor::new(vec![0u8; 6]));
        let mut chunker = FileChunker::new(file, &config(4, 100));

        chunker.next_chunk().await.unwrap();
        match chunker.next_chunk().await {
            Err(TransferError::Truncated { expected, got }) => {
                assert_eq!(expected, 10);
                assert_eq!(got, 6);
            }
            other => panic!("Expected truncation, got {:?}", other.map(|c| c.map(|b| b.len()))),
        }
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime("notes.txt"), "text/plain");
        assert_eq!(guess_mime("archive"), DEFAULT_MIME);
    }
}
