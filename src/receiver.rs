//! Receiver orchestration
//!
//! Turns the raw notification stream into glucose history batches:
//! chunks are reassembled into messages, classified, and history pages
//! are placed on the host timeline using the offset learned from the
//! receiver's clock message. A page that arrives before any clock message
//! is held until one does.

use crate::clock::ClockSync;
use crate::connection::{DeviceHandle, LinkHandler};
use crate::glucose::GlucoseRecord;
use crate::messages::{GlucoseHistoryMessage, Message, MessageParser};
use crate::reassembler::{CompleteMessage, StreamReassembler};
use crate::types::G4Error;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};

/// Callbacks from a `Receiver` to its owner
pub trait ReceiverDelegate: Send {
    /// A decoded, time-corrected page of history in device order
    fn on_glucose_history(&mut self, records: Vec<GlucoseRecord>);

    /// Non-fatal link error; see `G4Error::kind`
    fn on_error(&mut self, error: &G4Error);

    fn on_diagnostic_event(&mut self, text: &str) {
        let _ = text;
    }

    fn on_heartbeat(&mut self, received_at: DateTime<Utc>) {
        let _ = received_at;
    }
}

/// Configuration for message decoding
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// How far a clock message may stray from the host clock and still count
    pub clock_plausibility_window: TimeDelta,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            clock_plausibility_window: TimeDelta::days(3650),
        }
    }
}

pub struct Receiver<D> {
    config: ReceiverConfig,
    reassembler: StreamReassembler,
    clock: ClockSync,
    /// Latest page waiting for a clock message
    pending_history: Option<GlucoseHistoryMessage>,
    delegate: D,
}

impl<D: ReceiverDelegate> Receiver<D> {
    pub fn new(config: ReceiverConfig, delegate: D) -> Self {
        Self {
            config,
            reassembler: StreamReassembler::new(),
            clock: ClockSync::new(),
            pending_history: None,
            delegate,
        }
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    pub fn into_delegate(self) -> D {
        self.delegate
    }

    pub fn clock_offset(&self) -> Option<TimeDelta> {
        self.clock.offset()
    }

    pub fn has_pending_history(&self) -> bool {
        self.pending_history.is_some()
    }

    /// Feed one raw chunk from the receive characteristic
    pub fn receive_bytes(&mut self, bytes: &[u8], received_at: DateTime<Utc>) {
        self.reassembler.receive_bytes(bytes);
        while let Some(message) = self.reassembler.retrieve_message() {
            self.handle_message(message, received_at);
        }
    }

    /// Forget any partially received message
    pub fn reset_stream(&mut self) {
        self.reassembler.reset();
    }

    fn handle_message(&mut self, message: CompleteMessage, received_at: DateTime<Utc>) {
        let parsed = MessageParser::parse(
            message.as_bytes(),
            received_at,
            self.config.clock_plausibility_window,
        );

        match parsed {
            Ok(Message::Clock(clock)) => {
                let offset = self.clock.learn(clock.device_seconds, received_at);
                debug!(
                    "Receiver clock {} (offset {}s)",
                    clock.device_time(),
                    offset.num_seconds()
                );
                self.delegate
                    .on_diagnostic_event(&format!("Clock synchronized, offset {}s", offset.num_seconds()));

                if let Some(history) = self.pending_history.take() {
                    self.emit(history, offset);
                }
            }
            Ok(Message::GlucoseHistory(history)) => match self.clock.offset() {
                Some(offset) => self.emit(history, offset),
                None => {
                    debug!(
                        "Holding history page {} until the clock is known",
                        history.header.page_number
                    );
                    self.pending_history = Some(history);
                }
            },
            Err(err) => {
                debug!("Dropping {} byte message: {}", message.as_bytes().len(), err);
            }
        }
    }

    fn emit(&mut self, history: GlucoseHistoryMessage, offset: TimeDelta) {
        let records: Vec<GlucoseRecord> = history
            .records
            .iter()
            .map(|record| GlucoseRecord::from_history(record, offset))
            .collect();

        info!(
            "History page {}: {} records from #{}",
            history.header.page_number,
            records.len(),
            history.header.first_index
        );
        self.delegate.on_glucose_history(records);
    }
}

impl<D: ReceiverDelegate> LinkHandler for Receiver<D> {
    fn on_link_ready(&mut self, device: &DeviceHandle) {
        self.reset_stream();
        self.delegate
            .on_diagnostic_event(&format!("Listening to {}", device));
    }

    fn on_data(&mut self, data: &[u8], received_at: DateTime<Utc>) {
        self.receive_bytes(data, received_at);
    }

    fn on_heartbeat(&mut self, received_at: DateTime<Utc>) {
        self.delegate.on_heartbeat(received_at);
    }

    fn on_error(&mut self, error: &G4Error) {
        self.delegate.on_error(error);
    }

    fn on_diagnostic(&mut self, text: &str) {
        self.delegate.on_diagnostic_event(text);
    }
}
