//! Common types, enums, and error definitions for the G4 receiver link

use std::fmt;
use thiserror::Error;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, G4Error>;

/// Errors surfaced to the owner of a link.
///
/// None of these are fatal: the worst outcome is no data until the
/// connection comes back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum G4Error {
    #[error("Receiver not found among connected devices after {attempts} attempts")]
    DeviceNotFound { attempts: u32 },

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Service discovery failed: {0}")]
    ServiceDiscovery(String),

    #[error("Characteristic discovery failed: {0}")]
    CharacteristicDiscovery(String),

    #[error("Notification state update failed: {0}")]
    NotificationState(String),

    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Link event channel closed")]
    ChannelClosed,
}

impl G4Error {
    /// Coarse classification used by owners deciding how to present an error
    pub fn kind(&self) -> ErrorKind {
        match self {
            G4Error::DeviceNotFound { .. } => ErrorKind::DiscoveryExhausted,
            _ => ErrorKind::Transport,
        }
    }
}

/// Error classes reported through `ReceiverDelegate::on_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect/discovery/subscription failure or a disconnect; a reconnect follows
    Transport,
    /// Bounded discovery gave up; nothing happens until discovery is restarted
    DiscoveryExhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "TRANSPORT"),
            ErrorKind::DiscoveryExhausted => write!(f, "DISCOVERY_EXHAUSTED"),
        }
    }
}

/// Reasons a buffer was rejected by a decoder.
///
/// These are line noise on a lossy link and are dropped, never reported.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Wrong length: expected {expected} bytes, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("Buffer too short: {0} bytes")]
    TooShort(usize),

    #[error("Checksum mismatch: stored 0x{stored:04X}, computed 0x{computed:04X}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error("Bad frame markers: start 0x{start:02X}, ack 0x{ack:02X}")]
    BadFrameMarkers { start: u8, ack: u8 },

    #[error("Unexpected page tags: record type {record_type}, revision {revision}")]
    BadPageTags { record_type: u8, revision: u8 },

    #[error("Implausible device clock: {0} seconds")]
    ImplausibleClock(u32),

    #[error("Page truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Record {index} failed validation")]
    BadRecord { index: u32 },

    #[error("Unrecognized message ({0} bytes)")]
    Unrecognized(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(
            G4Error::DeviceNotFound { attempts: 3 }.kind(),
            ErrorKind::DiscoveryExhausted
        );
        assert_eq!(
            G4Error::ConnectFailed("timeout".to_string()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(G4Error::ChannelClosed.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_error_display() {
        let err = G4Error::DeviceNotFound { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "Receiver not found among connected devices after 3 attempts"
        );

        let err = DecodeError::ChecksumMismatch {
            stored: 0x526D,
            computed: 0x1234,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch: stored 0x526D, computed 0x1234"
        );
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Transport.to_string(), "TRANSPORT");
        assert_eq!(
            ErrorKind::DiscoveryExhausted.to_string(),
            "DISCOVERY_EXHAUSTED"
        );
    }
}
