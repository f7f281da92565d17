//! Incoming file reassembly

use bytes::{Bytes, BytesMut};

use super::chunker::DEFAULT_MIME;

/// A fully received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub data: Bytes,
}

/// Accumulates chunks of one incoming file
#[derive(Debug)]
pub struct ReassemblyBuffer {
    name: String,
    mime: String,
    expected: u64,
    received: u64,
    chunks: Vec<Bytes>,
}

impl ReassemblyBuffer {
    /// Start a buffer from a file header; an empty MIME type falls back to the default
    pub fn new(name: impl Into<String>, mime: impl Into<String>, expected: u64) -> Self {
        let mime = mime.into();
        Self {
            name: name.into(),
            mime: if mime.is_empty() {
                DEFAULT_MIME.to_string()
            } else {
                mime
            },
            expected,
            received: 0,
            chunks: Vec::new(),
        }
    }

    /// Append a chunk
    pub fn push(&mut self, chunk: Bytes) {
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    /// Fraction received, 1.0 for an empty file
    pub fn progress(&self) -> f64 {
        if self.expected == 0 {
            return 1.0;
        }
        (self.received as f64 / self.expected as f64).min(1.0)
    }

    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }

    /// Join the chunks into the received file
    pub fn finish(self) -> ReceivedFile {
        let mut data = BytesMut::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        ReceivedFile {
            name: self.name,
            mime: self.mime,
            size: self.expected,
            data: data.freeze(),
        }
    }
}
