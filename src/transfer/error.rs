//! Transfer error types

use thiserror::Error;

use crate::network::NetworkError;

/// Errors that can occur while sending or receiving files
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source ended early: expected {expected} bytes, got {got}")]
    Truncated { expected: u64, got: u64 },

    #[error("Invalid transfer configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel error: {0}")]
    Channel(#[from] NetworkError),

    #[error("Transfer engine stopped")]
    EngineStopped,
}
