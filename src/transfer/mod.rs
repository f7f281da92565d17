//! File and text transfer over a peer channel
//!
//! Files are streamed as fixed-size chunks grouped into partitions; the
//! receiver acknowledges each partition before the sender continues.

mod chunker;
mod digester;
mod engine;
mod error;

pub use chunker::{guess_mime, FileChunker, OutgoingFile, DEFAULT_MIME};
pub use digester::{ReassemblyBuffer, ReceivedFile};
pub use engine::{Direction, TransferCommand, TransferEngine, TransferEvent, TransferHandle};
pub use error::TransferError;

/// Bytes per chunk frame
pub const CHUNK_SIZE: usize = 64_000;

/// Bytes per partition before the sender waits for an acknowledgement
pub const PARTITION_SIZE: u64 = 1_000_000;

/// Minimum progress step reported back to the sender
pub const PROGRESS_THRESHOLD: f64 = 0.01;

/// Transfer configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Partition size in bytes
    pub partition_size: u64,
    /// Fraction of the file that must arrive between progress reports
    pub progress_threshold: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            partition_size: PARTITION_SIZE,
            progress_threshold: PROGRESS_THRESHOLD,
        }
    }
}

impl TransferConfig {
    /// Check the sizes and threshold are usable
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidConfig("chunk size must be non-zero".to_string()));
        }
        if self.partition_size == 0 {
            return Err(TransferError::InvalidConfig(
                "partition size must be non-zero".to_string(),
            ));
        }
        if self.chunk_size as u64 > self.partition_size {
            return Err(TransferError::InvalidConfig(format!(
                "chunk size {} exceeds partition size {}",
                self.chunk_size, self.partition_size
            )));
        }
        if !(0.0..=1.0).contains(&self.progress_threshold) {
            return Err(TransferError::InvalidConfig(format!(
                "progress threshold {} outside 0..1",
                self.progress_threshold
            )));
        }
        Ok(())
    }
}
