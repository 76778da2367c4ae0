//! Stream reassembly of receiver messages
//!
//! The receiver splits each message over as many notifications as it
//! needs. The first chunk of a message starts with a frame header that
//! declares the total length; chunks are accumulated until that many
//! bytes have arrived.
//!
//! Bytes beyond the declared length are treated as the start of the next
//! message, so a delivery that carries the tail of one message and the
//! head of another yields both.

use crate::messages::FrameHeader;
use log::debug;
use std::collections::VecDeque;

/// A fully received message, frame header and checksum included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMessage(Vec<u8>);

impl CompleteMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// At most one message is ever being accumulated
#[derive(Debug, Default)]
enum AssemblyState {
    #[default]
    Idle,
    InProgress { expected: usize, buffer: Vec<u8> },
}

/// Reassembles framed messages from raw notification payloads
#[derive(Debug, Default)]
pub struct StreamReassembler {
    state: AssemblyState,
    completed: VecDeque<CompleteMessage>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one raw chunk, in arrival order.
    ///
    /// A chunk arriving while no message is in progress must start with a
    /// valid frame header, otherwise it is discarded.
    pub fn receive_bytes(&mut self, bytes: &[u8]) {
        let mut chunk = bytes;
        while !chunk.is_empty() {
            chunk = self.absorb(chunk);
        }
    }

    /// Retrieve the oldest completed message, if any
    pub fn retrieve_message(&mut self) -> Option<CompleteMessage> {
        self.completed.pop_front()
    }

    /// Feed a chunk and return the next completed message.
    ///
    /// Messages completed by the same chunk stay queued for
    /// `retrieve_message`.
    pub fn ingest(&mut self, bytes: &[u8]) -> Option<CompleteMessage> {
        self.receive_bytes(bytes);
        self.retrieve_message()
    }

    /// Check if a completed message is waiting
    pub fn has_message(&self) -> bool {
        !self.completed.is_empty()
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.state, AssemblyState::InProgress { .. })
    }

    /// Drop the partial message and anything not yet retrieved
    pub fn reset(&mut self) {
        if let AssemblyState::InProgress { expected, buffer } = &self.state {
            debug!(
                "Dropping partial message ({} of {} bytes)",
                buffer.len(),
                expected
            );
        }
        self.state = AssemblyState::Idle;
        self.completed.clear();
    }

    /// Consume the front of `chunk` and return what belongs to the next message
    fn absorb<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        let (expected, mut buffer) = match std::mem::take(&mut self.state) {
            AssemblyState::InProgress { expected, buffer } => (expected, buffer),
            AssemblyState::Idle => match FrameHeader::parse_prefix(chunk) {
                Ok(header) if usize::from(header.total_bytes) >= FrameHeader::LENGTH => {
                    let expected = usize::from(header.total_bytes);
                    (expected, Vec::with_capacity(expected))
                }
                Ok(header) => {
                    debug!(
                        "Discarding {} byte chunk: frame declares {} bytes",
                        chunk.len(),
                        header.total_bytes
                    );
                    return &[];
                }
                Err(err) => {
                    debug!(
                        "Discarding {} byte chunk outside a message: {}",
                        chunk.len(),
                        err
                    );
                    return &[];
                }
            },
        };

        let take = (expected - buffer.len()).min(chunk.len());
        buffer.extend_from_slice(&chunk[..take]);

        if buffer.len() >= expected {
            debug!("Reassembled {} byte message", buffer.len());
            self.completed.push_back(CompleteMessage(buffer));
        } else {
            self.state = AssemblyState::InProgress { expected, buffer };
        }

        &chunk[take..]
    }
}
