//! Per-peer transfer engine
//!
//! One engine task runs per remote peer and plays both roles: it streams
//! queued files to the peer and reassembles files the peer streams back.
//!
//! Sending one file:
//!
//! ```text
//!   header ──► chunk × N ──► partition{offset} ──┐
//!                  ▲                             │ wait
//!                  └──── partition-received ◄────┘
//!   ... last chunk ──► wait for transfer-complete ──► next file
//! ```
//!
//! Commands are drained between chunks, so a cancel takes effect before the
//! next chunk is read.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::peer::{ChannelFrame, PeerChannel, PeerDirectory};
use crate::protocol::{text, PeerMessage};

use super::chunker::{FileChunker, OutgoingFile};
use super::digester::{ReassemblyBuffer, ReceivedFile};
use super::error::TransferError;
use super::TransferConfig;

/// Which side of a transfer a progress report describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reported by the remote receiver of our file
    Sending,
    /// Measured locally while receiving
    Receiving,
}

/// Events raised by a transfer engine
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    IncomingFile {
        peer: String,
        name: String,
        mime: String,
        size: u64,
    },
    Progress {
        peer: String,
        direction: Direction,
        progress: f64,
    },
    FileReceived {
        peer: String,
        file: ReceivedFile,
    },
    FileSent {
        peer: String,
        name: String,
    },
    TextReceived {
        peer: String,
        sender: String,
        text: String,
    },
    /// The remote sender abandoned its file
    RemoteCancelled {
        peer: String,
    },
    /// The remote sender is starting a new file after a cancel
    CancelCleared {
        peer: String,
    },
    TransferFailed {
        peer: String,
        name: String,
        reason: String,
    },
}

/// Commands accepted by a transfer engine
#[derive(Debug)]
pub enum TransferCommand {
    Enqueue(Vec<OutgoingFile>),
    SendText(String),
    Cancel,
    Inbound(ChannelFrame),
}

/// Handle to a running transfer engine
#[derive(Debug, Clone)]
pub struct TransferHandle {
    peer: String,
    tx: mpsc::UnboundedSender<TransferCommand>,
}

impl TransferHandle {
    /// Remote identity this engine talks to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue files; they are sent one at a time in order
    pub fn enqueue(&self, files: Vec<OutgoingFile>) -> Result<(), TransferError> {
        self.command(TransferCommand::Enqueue(files))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransferError> {
        self.command(TransferCommand::SendText(text.into()))
    }

    /// Abandon the in-flight file and everything queued behind it
    pub fn cancel(&self) -> Result<(), TransferError> {
        self.command(TransferCommand::Cancel)
    }

    /// Hand a frame received from the peer to the engine
    pub fn deliver(&self, frame: ChannelFrame) -> Result<(), TransferError> {
        self.command(TransferCommand::Inbound(frame))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn command(&self, command: TransferCommand) -> Result<(), TransferError> {
        self.tx.send(command).map_err(|_| TransferError::EngineStopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Streaming,
    AwaitingPartitionAck,
    AwaitingComplete,
}

struct Outgoing {
    name: String,
    chunker: FileChunker,
    phase: SendPhase,
}

/// Acknowledgements still owed for a cancelled file
#[derive(Debug, Default)]
struct StaleAcks {
    partitions: u32,
    completions: u32,
}

impl StaleAcks {
    fn record(&mut self, phase: SendPhase) {
        match phase {
            SendPhase::Streaming => {}
            SendPhase::AwaitingPartitionAck => self.partitions += 1,
            SendPhase::AwaitingComplete => self.completions += 1,
        }
    }
}

struct Incoming {
    buffer: ReassemblyBuffer,
    last_reported: f64,
}

/// Transfer state for one remote peer
pub struct TransferEngine {
    peer: String,
    config: TransferConfig,
    channel: Arc<dyn PeerChannel>,
    directory: PeerDirectory,
    events: mpsc::UnboundedSender<TransferEvent>,
    queue: VecDeque<OutgoingFile>,
    busy: bool,
    cancelled: bool,
    stale: StaleAcks,
    outgoing: Option<Outgoing>,
    incoming: Option<Incoming>,
}

impl TransferEngine {
    /// Start an engine task for `peer`
    pub fn spawn(
        peer: impl Into<String>,
        channel: Arc<dyn PeerChannel>,
        directory: PeerDirectory,
        config: TransferConfig,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> (TransferHandle, JoinHandle<()>) {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            peer: peer.clone(),
            config,
            channel,
            directory,
            events,
            queue: VecDeque::new(),
            busy: false,
            cancelled: false,
            stale: StaleAcks::default(),
            outgoing: None,
            incoming: None,
        };
        let task = tokio::spawn(engine.run(rx));
        (TransferHandle { peer, tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TransferCommand>) {
        loop {
            let command = if self.is_streaming() {
                match commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv().await {
                    Some(command) => Some(command),
                    None => break,
                }
            };

            match command {
                Some(command) => self.handle(command).await,
                None => self.pump().await,
            }
        }
        debug!("Transfer engine for {} stopped", self.peer);
    }

    fn is_streaming(&self) -> bool {
        matches!(
            self.outgoing,
            Some(Outgoing {
                phase: SendPhase::Streaming,
                ..
            })
        )
    }

    async fn handle(&mut self, command: TransferCommand) {
        match command {
            TransferCommand::Enqueue(files) => {
                self.queue.extend(files);
                self.dequeue().await;
            }
            TransferCommand::SendText(body) => {
                let message = text::text_message(&body, &self.local_name());
                self.send_control(&message).await;
            }
            TransferCommand::Cancel => self.cancel().await,
            TransferCommand::Inbound(ChannelFrame::Chunk(chunk)) => self.on_chunk(chunk).await,
            TransferCommand::Inbound(ChannelFrame::Control(json)) => self.on_control(&json).await,
        }
    }

    fn local_name(&self) -> String {
        self.directory
            .local_name()
            .unwrap_or_else(|| "Unknown".to_string())
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    async fn send_control(&self, message: &PeerMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                return;
            }
        };
        if let Err(e) = self.channel.send(ChannelFrame::Control(json)).await {
            warn!("Failed to send {} to {}: {}", message.kind(), self.peer, e);
        }
    }

    // ---- sending ----

    async fn dequeue(&mut self) {
        if self.busy {
            return;
        }
        let Some(file) = self.queue.pop_front() else {
            return;
        };
        self.busy = true;

        if self.cancelled {
            self.send_control(&PeerMessage::MClearCancel).await;
            self.cancelled = false;
        }

        info!("Sending {} ({} bytes) to {}", file.name, file.size, self.peer);
        let header = PeerMessage::Header {
            name: file.name.clone(),
            mime: file.mime.clone(),
            size: file.size,
            sender: Some(self.local_name()),
        };
        self.send_control(&header).await;

        let name = file.name.clone();
        let chunker = FileChunker::new(file, &self.config);
        let phase = if chunker.is_file_end() {
            SendPhase::AwaitingComplete
        } else {
            SendPhase::Streaming
        };
        self.outgoing = Some(Outgoing {
            name,
            chunker,
            phase,
        });
    }

    /// Send one chunk of the in-flight file
    async fn pump(&mut self) {
        let read = match self.outgoing.as_mut() {
            Some(outgoing) => outgoing.chunker.next_chunk().await,
            None => return,
        };

        match read {
            Ok(Some(chunk)) => {
                trace!("Chunk of {} bytes to {}", chunk.len(), self.peer);
                if let Err(e) = self.channel.send(ChannelFrame::Chunk(chunk)).await {
                    warn!("Failed to send chunk to {}: {}", self.peer, e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.fail_outgoing(e).await;
                return;
            }
        }

        let mut marker = None;
        if let Some(outgoing) = self.outgoing.as_mut() {
            if outgoing.chunker.is_file_end() {
                debug!("All of {} sent to {}", outgoing.name, self.peer);
                outgoing.phase = SendPhase::AwaitingComplete;
            } else if outgoing.chunker.is_partition_end() {
                outgoing.phase = SendPhase::AwaitingPartitionAck;
                marker = Some(outgoing.chunker.offset());
            }
        }
        if let Some(offset) = marker {
            trace!("Partition end at {} for {}", offset, self.peer);
            self.send_control(&PeerMessage::Partition { offset }).await;
        }

        tokio::task::yield_now().await;
    }

    async fn fail_outgoing(&mut self, error: TransferError) {
        if let Some(outgoing) = self.outgoing.take() {
            warn!("Sending {} to {} failed: {}", outgoing.name, self.peer, error);
            self.emit(TransferEvent::TransferFailed {
                peer: self.peer.clone(),
                name: outgoing.name,
                reason: error.to_string(),
            });
        }
        // The receiver holds a partial buffer; tell it to drop it
        self.cancelled = true;
        self.send_control(&PeerMessage::CancelSend {
            sender: Some(self.local_name()),
        })
        .await;
        self.busy = false;
        self.dequeue().await;
    }

    async fn cancel(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        match self.outgoing.take() {
            Some(outgoing) => {
                info!(
                    "Cancelled {} to {} ({} queued files dropped)",
                    outgoing.name, self.peer, dropped
                );
                // The receiver answers markers it already has
                self.stale.record(outgoing.phase);
            }
            None => debug!("Cancel for {} with nothing in flight", self.peer),
        }
        self.cancelled = true;
        self.busy = false;
        self.send_control(&PeerMessage::CancelSend {
            sender: Some(self.local_name()),
        })
        .await;
    }

    fn on_partition_received(&mut self) {
        if self.stale.partitions > 0 {
            self.stale.partitions -= 1;
            debug!("Late partition-received from {} for a cancelled file", self.peer);
            return;
        }
        match self.outgoing.as_mut() {
            Some(outgoing) if outgoing.phase == SendPhase::AwaitingPartitionAck => {
                outgoing.chunker.next_partition();
                outgoing.phase = SendPhase::Streaming;
            }
            _ => debug!("Unexpected partition-received from {}", self.peer),
        }
    }

    async fn on_transfer_complete(&mut self) {
        if self.stale.completions > 0 {
            self.stale.completions -= 1;
            debug!("Late transfer-complete from {} for a cancelled file", self.peer);
            return;
        }
        match self.outgoing.take() {
            Some(outgoing) if outgoing.phase == SendPhase::AwaitingComplete => {
                info!("{} delivered to {}", outgoing.name, self.peer);
                self.emit(TransferEvent::FileSent {
                    peer: self.peer.clone(),
                    name: outgoing.name,
                });
                self.busy = false;
                self.dequeue().await;
            }
            other => {
                debug!("Stale transfer-complete from {}", self.peer);
                self.outgoing = other;
            }
        }
    }

    // ---- receiving ----

    async fn on_control(&mut self, json: &str) {
        let message: PeerMessage = match serde_json::from_str(json) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed frame from {}: {}", self.peer, e);
                return;
            }
        };
        trace!("{} from {}", message.kind(), self.peer);

        match message {
            PeerMessage::Header {
                name, mime, size, ..
            } => self.on_header(name, mime, size).await,
            PeerMessage::Partition { offset } => {
                let received = self
                    .incoming
                    .as_ref()
                    .map(|i| i.buffer.bytes_received())
                    .unwrap_or(offset);
                self.send_control(&PeerMessage::PartitionReceived { offset: received })
                    .await;
            }
            PeerMessage::PartitionReceived { .. } => self.on_partition_received(),
            PeerMessage::Progress { progress } => self.emit(TransferEvent::Progress {
                peer: self.peer.clone(),
                direction: Direction::Sending,
                progress,
            }),
            PeerMessage::TransferComplete { .. } => self.on_transfer_complete().await,
            PeerMessage::CancelSend { .. } => {
                if let Some(incoming) = self.incoming.take() {
                    info!(
                        "{} cancelled {} after {} bytes",
                        self.peer,
                        incoming.buffer.name(),
                        incoming.buffer.bytes_received()
                    );
                }
                self.emit(TransferEvent::RemoteCancelled {
                    peer: self.peer.clone(),
                });
            }
            PeerMessage::MClearCancel => self.emit(TransferEvent::CancelCleared {
                peer: self.peer.clone(),
            }),
            PeerMessage::Text { text, sender } => self.on_text(&text, &sender),
            PeerMessage::Unrecognized => {
                debug!("Unknown message type from {}, dropped", self.peer);
            }
        }
    }

    async fn on_header(&mut self, name: String, mime: String, size: u64) {
        if let Some(previous) = self.incoming.take() {
            warn!(
                "Header from {} replaces unfinished {}",
                self.peer,
                previous.buffer.name()
            );
            self.emit(TransferEvent::RemoteCancelled {
                peer: self.peer.clone(),
            });
        }
        info!("Receiving {} ({} bytes) from {}", name, size, self.peer);

        let buffer = ReassemblyBuffer::new(name.clone(), mime, size);
        self.emit(TransferEvent::IncomingFile {
            peer: self.peer.clone(),
            name,
            mime: buffer.mime().to_string(),
            size,
        });
        self.incoming = Some(Incoming {
            buffer,
            last_reported: 0.0,
        });

        if size == 0 {
            self.complete_incoming().await;
        }
    }

    async fn on_chunk(&mut self, chunk: Bytes) {
        let threshold = self.config.progress_threshold;
        let Some(incoming) = self.incoming.as_mut() else {
            debug!("Chunk from {} without a file header, dropped", self.peer);
            return;
        };

        incoming.buffer.push(chunk);
        let progress = incoming.buffer.progress();
        let report = progress - incoming.last_reported >= threshold;
        if report {
            incoming.last_reported = progress;
        }
        let complete = incoming.buffer.is_complete();

        self.emit(TransferEvent::Progress {
            peer: self.peer.clone(),
            direction: Direction::Receiving,
            progress,
        });
        if report && !complete {
            self.send_control(&PeerMessage::Progress { progress }).await;
        }
        if complete {
            self.complete_incoming().await;
        }
    }

    async fn complete_incoming(&mut self) {
        let Some(incoming) = self.incoming.take() else {
            return;
        };
        let file = incoming.buffer.finish();
        info!("Received {} ({} bytes) from {}", file.name, file.size, self.peer);
        self.emit(TransferEvent::FileReceived {
            peer: self.peer.clone(),
            file,
        });
        self.send_control(&PeerMessage::TransferComplete {
            sender: Some(self.local_name()),
        })
        .await;
    }

    fn on_text(&self, body: &str, sender: &str) {
        let Some(body) = text::decode(body) else {
            debug!("Undecodable text from {}, dropped", self.peer);
            return;
        };
        // A relay overwrites `sender` with the identity
        let sender = if sender == self.peer {
            None
        } else {
            text::decode(sender)
        };
        let sender = sender
            .or_else(|| self.directory.display_name(&self.peer))
            .unwrap_or_else(|| self.peer.clone());

        self.emit(TransferEvent::TextReceived {
            peer: self.peer.clone(),
            sender,
            text: body,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkError;
    use crate::protocol::{DisplayMetadata, DisplayNameInfo, PeerInfo};
    use crate::transfer::DEFAULT_MIME;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::time::Duration;

    struct RecordingChannel {
        tx: mpsc::UnboundedSender<ChannelFrame>,
    }

    #[async_trait]
    impl PeerChannel for RecordingChannel {
        async fn send(&self, frame: ChannelFrame) -> Result<(), NetworkError> {
            self.tx.send(frame).map_err(|_| NetworkError::ChannelClosed)
        }

        fn kind(&self) -> &'static str {
            "recording"
        }
    }

    struct Harness {
        handle: TransferHandle,
        frames: mpsc::UnboundedReceiver<ChannelFrame>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
    }

    fn directory_named(name: &str) -> PeerDirectory {
        let directory = PeerDirectory::new();
        directory.set_local(DisplayNameInfo {
            display_name: name.to_string(),
            device_name: "Test".to_string(),
            peer_id: None,
        });
        directory
    }

    fn spawn_engine(config: TransferConfig) -> Harness {
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (handle, _task) = TransferEngine::spawn(
            "remote",
            Arc::new(RecordingChannel { tx: frame_tx }),
            directory_named("Amber Owl"),
            config,
            event_tx,
        );
        Harness {
            handle,
            frames,
            events,
        }
    }

    async fn next_frame(frames: &mut mpsc::UnboundedReceiver<ChannelFrame>) -> ChannelFrame {
        tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    async fn next_control(frames: &mut mpsc::UnboundedReceiver<ChannelFrame>) -> PeerMessage {
        match next_frame(frames).await {
            ChannelFrame::Control(json) => serde_json::from_str(&json).unwrap(),
            ChannelFrame::Chunk(chunk) => panic!("Expected control, got {} byte chunk", chunk.len()),
        }
    }

    async fn next_chunk(frames: &mut mpsc::UnboundedReceiver<ChannelFrame>) -> Bytes {
        match next_frame(frames).await {
            ChannelFrame::Chunk(chunk) => chunk,
            ChannelFrame::Control(json) => panic!("Expected chunk, got {}", json),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TransferEvent>) -> TransferEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("engine stopped")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn control(message: PeerMessage) -> ChannelFrame {
        ChannelFrame::Control(message.to_json().unwrap())
    }

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    /// Given: a 2.5 MB file with default chunk and partition sizes
    /// When: the engine sends it and the receiver acknowledges each partition
    /// Then: the frame sequence pauses at each partition and ends with transfer-complete
    #[tokio::test]
    async fn test_partitioned_send_sequence() {
        let mut h = spawn_engine(TransferConfig::default());
        let data = pattern(2_500_000);
        h.handle
            .enqueue(vec![OutgoingFile::from_bytes("big.bin", DEFAULT_MIME, data.clone())])
            .unwrap();

        match next_control(&mut h.frames).await {
            PeerMessage::Header {
                name, size, sender, ..
            } => {
                assert_eq!(name, "big.bin");
                assert_eq!(size, 2_500_000);
                assert_eq!(sender.as_deref(), Some("Amber Owl"));
            }
            other => panic!("Expected header, got {:?}", other),
        }

        let mut received = Vec::new();
        for (chunks, offset) in [(16, 1_024_000u64), (16, 2_048_000)] {
            for _ in 0..chunks {
                received.extend_from_slice(&next_chunk(&mut h.frames).await);
            }
            assert_eq!(next_control(&mut h.frames).await, PeerMessage::Partition { offset });

            settle().await;
            assert!(h.frames.try_recv().is_err(), "sent past a partition without ack");

            h.handle
                .deliver(control(PeerMessage::PartitionReceived { offset }))
                .unwrap();
        }

        for _ in 0..8 {
            received.extend_from_slice(&next_chunk(&mut h.frames).await);
        }
        settle().await;
        assert!(h.frames.try_recv().is_err());
        assert_eq!(received, data);

        h.handle
            .deliver(control(PeerMessage::TransferComplete { sender: None }))
            .unwrap();
        assert_eq!(
            next_event(&mut h.events).await,
            TransferEvent::FileSent {
                peer: "remote".to_string(),
                name: "big.bin".to_string()
            }
        );
    }

    /// Given: two queued files
    /// When: the first is fully sent
    /// Then: the second header only follows transfer-complete
    #[tokio::test]
    async fn test_next_file_waits_for_transfer_complete() {
        let mut h = spawn_engine(TransferConfig::default());
        h.handle
            .enqueue(vec![
                OutgoingFile::from_bytes("one.txt", "text/plain", b"first".to_vec()),
                OutgoingFile::from_bytes("two.txt", "text/plain", b"second".to_vec()),
            ])
            .unwrap();

        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "one.txt"));
        assert_eq!(next_chunk(&mut h.frames).await, Bytes::from_static(b"first"));
        settle().await;
        assert!(h.frames.try_recv().is_err());

        h.handle
            .deliver(control(PeerMessage::TransferComplete { sender: None }))
            .unwrap();
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "two.txt"));

        // A duplicate completion must not end the second file early
        h.handle
            .deliver(control(PeerMessage::TransferComplete { sender: None }))
            .unwrap();
        assert_eq!(next_chunk(&mut h.frames).await, Bytes::from_static(b"second"));
        settle().await;

        let mut sent = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let TransferEvent::FileSent { name, .. } = event {
                sent.push(name);
            }
        }
        assert_eq!(sent, vec!["one.txt".to_string()]);
    }

    /// Given: a transfer paused at a partition with another file queued
    /// When: the sender cancels and later enqueues a new file
    /// Then: cancel-send goes out, the queue is gone, and m-clear-cancel precedes the new header
    #[tokio::test]
    async fn test_cancel_discards_queue() {
        let config = TransferConfig {
            chunk_size: 10,
            partition_size: 20,
            ..Default::default()
        };
        let mut h = spawn_engine(config);
        h.handle
            .enqueue(vec![
                OutgoingFile::from_bytes("a.bin", DEFAULT_MIME, pattern(100)),
                OutgoingFile::from_bytes("b.bin", DEFAULT_MIME, pattern(100)),
            ])
            .unwrap();

        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { .. }));
        next_chunk(&mut h.frames).await;
        next_chunk(&mut h.frames).await;
        assert_eq!(next_control(&mut h.frames).await, PeerMessage::Partition { offset: 20 });

        h.handle.cancel().unwrap();
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::CancelSend { .. }));

        // A late ack for the abandoned file changes nothing
        h.handle
            .deliver(control(PeerMessage::PartitionReceived { offset: 20 }))
            .unwrap();
        settle().await;
        assert!(h.frames.try_recv().is_err(), "queue was not discarded");

        h.handle
            .enqueue(vec![OutgoingFile::from_bytes("c.bin", DEFAULT_MIME, pattern(5))])
            .unwrap();
        assert_eq!(next_control(&mut h.frames).await, PeerMessage::MClearCancel);
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "c.bin"));
    }

    /// Given: a file cancelled while awaiting transfer-complete, then two new files queued
    /// When: the late transfer-complete for the cancelled file arrives
    /// Then: the next header still waits for the current file's own completion
    #[tokio::test]
    async fn test_late_completion_after_cancel_is_swallowed() {
        let mut h = spawn_engine(TransferConfig::default());
        h.handle
            .enqueue(vec![OutgoingFile::from_bytes("a.bin", DEFAULT_MIME, pattern(10))])
            .unwrap();
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "a.bin"));
        next_chunk(&mut h.frames).await;

        h.handle.cancel().unwrap();
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::CancelSend { .. }));

        h.handle
            .enqueue(vec![
                OutgoingFile::from_bytes("c.bin", DEFAULT_MIME, pattern(5)),
                OutgoingFile::from_bytes("d.bin", DEFAULT_MIME, pattern(5)),
            ])
            .unwrap();
        assert_eq!(next_control(&mut h.frames).await, PeerMessage::MClearCancel);
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "c.bin"));
        next_chunk(&mut h.frames).await;

        h.handle
            .deliver(control(PeerMessage::TransferComplete { sender: None }))
            .unwrap();
        settle().await;
        assert!(h.frames.try_recv().is_err(), "d.bin started before c.bin was acknowledged");

        h.handle
            .deliver(control(PeerMessage::TransferComplete { sender: None }))
            .unwrap();
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "d.bin"));

        let mut sent = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let TransferEvent::FileSent { name, .. } = event {
                sent.push(name);
            }
        }
        assert_eq!(sent, vec!["c.bin".to_string()]);
    }

    /// Given: a file cancelled at a partition boundary, then a new multi-partition file
    /// When: the late partition-received for the cancelled file arrives
    /// Then: the new file stays paused until its own partition is acknowledged
    #[tokio::test]
    async fn test_late_partition_ack_after_cancel_is_swallowed() {
        let config = TransferConfig {
            chunk_size: 10,
            partition_size: 20,
            ..Default::default()
        };
        let mut h = spawn_engine(config);
        h.handle
            .enqueue(vec![OutgoingFile::from_bytes("a.bin", DEFAULT_MIME, pattern(100))])
            .unwrap();
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { .. }));
        next_chunk(&mut h.frames).await;
        next_chunk(&mut h.frames).await;
        assert_eq!(next_control(&mut h.frames).await, PeerMessage::Partition { offset: 20 });

        h.handle.cancel().unwrap();
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::CancelSend { .. }));

        h.handle
            .enqueue(vec![OutgoingFile::from_bytes("b.bin", DEFAULT_MIME, pattern(60))])
            .unwrap();
        assert_eq!(next_control(&mut h.frames).await, PeerMessage::MClearCancel);
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "b.bin"));
        next_chunk(&mut h.frames).await;
        next_chunk(&mut h.frames).await;
        assert_eq!(next_control(&mut h.frames).await, PeerMessage::Partition { offset: 20 });

        h.handle
            .deliver(control(PeerMessage::PartitionReceived { offset: 20 }))
            .unwrap();
        settle().await;
        assert!(h.frames.try_recv().is_err(), "partition released by a stale ack");

        h.handle
            .deliver(control(PeerMessage::PartitionReceived { offset: 20 }))
            .unwrap();
        next_chunk(&mut h.frames).await;
        next_chunk(&mut h.frames).await;
        assert_eq!(next_control(&mut h.frames).await, PeerMessage::Partition { offset: 40 });
    }

    /// Given: a receiver part way into a file
    /// When: a header for another file arrives
    /// Then: the unfinished file is reported as cancelled before the new one starts
    #[tokio::test]
    async fn test_replaced_header_reports_cancel() {
        let mut h = spawn_engine(TransferConfig::default());
        for name in ["old.bin", "new.bin"] {
            h.handle
                .deliver(control(PeerMessage::Header {
                    name: name.to_string(),
                    mime: String::new(),
                    size: 100,
                    sender: None,
                }))
                .unwrap();
            if name == "old.bin" {
                h.handle
                    .deliver(ChannelFrame::Chunk(Bytes::from(pattern(10))))
                    .unwrap();
            }
        }

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match next_event(&mut h.events).await {
                TransferEvent::IncomingFile { name, .. } => seen.push(name),
                TransferEvent::RemoteCancelled { peer } => seen.push(format!("cancel:{}", peer)),
                _ => {}
            }
        }
        assert_eq!(seen, ["old.bin", "cancel:remote", "new.bin"]);
    }

    /// Given: a receiver part way into a file
    /// When: a partition marker arrives
    /// Then: the acknowledgement carries the receiver's own byte count
    #[tokio::test]
    async fn test_partition_ack_uses_received_bytes() {
        let mut h = spawn_engine(TransferConfig::default());
        h.handle
            .deliver(control(PeerMessage::Header {
                name: "x".to_string(),
                mime: String::new(),
                size: 100,
                sender: None,
            }))
            .unwrap();
        h.handle
            .deliver(ChannelFrame::Chunk(Bytes::from(pattern(40))))
            .unwrap();
        h.handle
            .deliver(control(PeerMessage::Partition { offset: 999 }))
            .unwrap();

        loop {
            match next_control(&mut h.frames).await {
                PeerMessage::Progress { .. } => continue,
                other => {
                    assert_eq!(other, PeerMessage::PartitionReceived { offset: 40 });
                    break;
                }
            }
        }
    }

    /// Given: a progress threshold of 0.25
    /// When: a 100 byte file arrives in ten chunks
    /// Then: the sender hears about progress three times, then transfer-complete once
    #[tokio::test]
    async fn test_progress_reports_are_throttled() {
        let config = TransferConfig {
            progress_threshold: 0.25,
            ..Default::default()
        };
        let mut h = spawn_engine(config);
        h.handle
            .deliver(control(PeerMessage::Header {
                name: "x".to_string(),
                mime: String::new(),
                size: 100,
                sender: None,
            }))
            .unwrap();
        for _ in 0..10 {
            h.handle
                .deliver(ChannelFrame::Chunk(Bytes::from(pattern(10))))
                .unwrap();
        }

        let mut reports = Vec::new();
        loop {
            match next_control(&mut h.frames).await {
                PeerMessage::Progress { progress } => reports.push(progress),
                PeerMessage::TransferComplete { .. } => break,
                other => panic!("Unexpected {:?}", other),
            }
        }
        assert_eq!(reports.len(), 3);
        assert!((reports[0] - 0.3).abs() < 1e-9);
        settle().await;
        assert!(h.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_zero_length_file_completes_at_header() {
        let mut h = spawn_engine(TransferConfig::default());
        h.handle
            .deliver(control(PeerMessage::Header {
                name: "empty".to_string(),
                mime: String::new(),
                size: 0,
                sender: None,
            }))
            .unwrap();

        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::TransferComplete { .. }));
        loop {
            if let TransferEvent::FileReceived { file, .. } = next_event(&mut h.events).await {
                assert_eq!(file.name, "empty");
                assert_eq!(file.mime, DEFAULT_MIME);
                assert!(file.data.is_empty());
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_remote_cancel_discards_partial_file() {
        let mut h = spawn_engine(TransferConfig::default());
        h.handle
            .deliver(control(PeerMessage::Header {
                name: "x".to_string(),
                mime: String::new(),
                size: 20,
                sender: None,
            }))
            .unwrap();
        h.handle
            .deliver(ChannelFrame::Chunk(Bytes::from(pattern(10))))
            .unwrap();
        h.handle
            .deliver(control(PeerMessage::CancelSend { sender: None }))
            .unwrap();
        h.handle
            .deliver(ChannelFrame::Chunk(Bytes::from(pattern(10))))
            .unwrap();
        settle().await;

        let mut cancelled = false;
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, TransferEvent::FileReceived { .. }));
            cancelled |= matches!(event, TransferEvent::RemoteCancelled { .. });
        }
        assert!(cancelled);
    }

    #[tokio::test]
    async fn test_truncated_source_fails_and_moves_on() {
        let mut h = spawn_engine(TransferConfig::default());
        h.handle
            .enqueue(vec![
                OutgoingFile::new("short.bin", DEFAULT_MIME, 10, Cursor::new(vec![0u8; 4])),
                OutgoingFile::from_bytes("ok.txt", "text/plain", b"ok".to_vec()),
            ])
            .unwrap();

        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "short.bin"));
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::CancelSend { .. }));
        assert_eq!(next_control(&mut h.frames).await, PeerMessage::MClearCancel);
        assert!(matches!(next_control(&mut h.frames).await, PeerMessage::Header { name, .. } if name == "ok.txt"));

        match next_event(&mut h.events).await {
            TransferEvent::TransferFailed { name, .. } => assert_eq!(name, "short.bin"),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_sender_falls_back_to_directory() {
        let (frame_tx, _frames) = mpsc::unbounded_channel();
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let directory = directory_named("Me");
        directory.upsert(PeerInfo {
            id: "remote".to_string(),
            name: DisplayMetadata {
                display_name: "Teal Fox".to_string(),
                device_name: "Test".to_string(),
            },
            rtc_supported: false,
        });
        let (handle, _task) = TransferEngine::spawn(
            "remote",
            Arc::new(RecordingChannel { tx: frame_tx }),
            directory,
            TransferConfig::default(),
            event_tx,
        );

        handle
            .deliver(control(PeerMessage::Text {
                text: text::encode("hi there"),
                sender: "remote".to_string(),
            }))
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransferEvent::TextReceived {
                peer: "remote".to_string(),
                sender: "Teal Fox".to_string(),
                text: "hi there".to_string(),
            }
        );
    }

    // ---- two engines wired back to back ----

    fn pipe(mut frames: mpsc::UnboundedReceiver<ChannelFrame>, to: TransferHandle) {
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if to.deliver(frame).is_err() {
                    break;
                }
            }
        });
    }

    struct Pair {
        alice: TransferHandle,
        bob: TransferHandle,
        bob_events: mpsc::UnboundedReceiver<TransferEvent>,
        alice_events: mpsc::UnboundedReceiver<TransferEvent>,
    }

    fn spawn_pair() -> Pair {
        let (a_tx, a_frames) = mpsc::unbounded_channel();
        let (b_tx, b_frames) = mpsc::unbounded_channel();
        let (a_event_tx, alice_events) = mpsc::unbounded_channel();
        let (b_event_tx, bob_events) = mpsc::unbounded_channel();

        let (alice, _) = TransferEngine::spawn(
            "bob",
            Arc::new(RecordingChannel { tx: a_tx }),
            directory_named("Amber Owl"),
            TransferConfig::default(),
            a_event_tx,
        );
        let (bob, _) = TransferEngine::spawn(
            "alice",
            Arc::new(RecordingChannel { tx: b_tx }),
            directory_named("Teal Fox"),
            TransferConfig::default(),
            b_event_tx,
        );
        pipe(a_frames, bob.clone());
        pipe(b_frames, alice.clone());
        Pair {
            alice,
            bob,
            bob_events,
            alice_events,
        }
    }

    #[tokio::test]
    async fn test_text_round_trip() {
        let mut pair = spawn_pair();
        pair.alice.send_text("hello 👋").unwrap();

        assert_eq!(
            next_event(&mut pair.bob_events).await,
            TransferEvent::TextReceived {
                peer: "alice".to_string(),
                sender: "Amber Owl".to_string(),
                text: "hello 👋".to_string(),
            }
        );
    }

    /// Given: files of sizes around the chunk and partition boundaries
    /// When: each is sent between two engines
    /// Then: the receiver gets identical bytes and the sender sees one completion per file
    #[tokio::test]
    async fn test_files_arrive_intact() {
        let mut pair = spawn_pair();
        let sizes = [0usize, 1, 63_999, 64_000, 64_001, 1_000_000, 1_024_000, 2_500_000];
        let files = sizes
            .iter()
            .map(|&size| OutgoingFile::from_bytes(format!("f{}", size), DEFAULT_MIME, pattern(size)))
            .collect();
        pair.alice.enqueue(files).unwrap();

        let mut received = Vec::new();
        while received.len() < sizes.len() {
            if let TransferEvent::FileReceived { file, .. } = next_event(&mut pair.bob_events).await {
                received.push(file);
            }
        }
        for (file, &size) in received.iter().zip(sizes.iter()) {
            assert_eq!(file.name, format!("f{}", size));
            assert_eq!(file.data.as_ref(), pattern(size).as_slice());
        }

        let mut sent = 0;
        while sent < sizes.len() {
            if let TransferEvent::FileSent { .. } = next_event(&mut pair.alice_events).await {
                sent += 1;
            }
        }
        settle().await;
        while let Ok(event) = pair.alice_events.try_recv() {
            assert!(!matches!(event, TransferEvent::FileSent { .. }));
        }
    }
}
