//! Dexcom G4 Share receiver link
//!
//! This library listens to a G4 Share receiver over Bluetooth Low Energy:
//! it keeps the connection alive and decodes the receiver's framed
//! messages into glucose readings on the host's timeline.
//!
//! # Modules
//!
//! - `connection`: connection lifecycle state machine and its actor
//! - `receiver`: reassembly, decoding and clock correction of the data stream
//! - `reassembler`: rebuilds framed messages from notification chunks
//! - `messages`: clock and glucose history message decoders
//! - `clock`: device epoch and host/device clock offset
//! - `glucose`: glucose records, trend arrows and sentinel values
//! - `monitor`: de-duplication of history pages for the owner
//! - `crc`: CRC-16 used by every message
//! - `services`: GATT identifiers of the receiver
//! - `bluez` (feature `bluetooth`): transport over BlueZ
//! - `types`: Common types and errors used throughout the library

#[cfg(feature = "bluetooth")]
pub mod bluez;
pub mod clock;
pub mod connection;
pub mod crc;
pub mod glucose;
pub mod messages;
pub mod monitor;
pub mod reassembler;
pub mod receiver;
pub mod services;
pub mod types;

#[cfg(test)]
mod test_support;

#[cfg(feature = "bluetooth")]
pub use bluez::BluezTransport;
pub use clock::{ClockSync, DEVICE_EPOCH_UNIX};
pub use connection::{
    event_channel, Action, CharacteristicInfo, ConnectionConfig, ConnectionHandle,
    ConnectionManager, ConnectionState, ConnectionStateMachine, DeviceHandle, Event, EventReceiver,
    EventSender, LinkHandler, Transport, TransportEvent,
};
pub use glucose::{GlucoseRecord, SpecialGlucose, TrendArrow};
pub use messages::{
    ClockMessage, FrameHeader, GlucoseHistoryMessage, HistoryPageHeader, HistoryRecord, Message,
    MessageParser,
};
pub use monitor::{GlucoseMonitor, GlucoseSample, SampleSink};
pub use reassembler::{CompleteMessage, StreamReassembler};
pub use receiver::{Receiver, ReceiverConfig, ReceiverDelegate};
pub use types::{DecodeError, ErrorKind, G4Error, Result};

/// Format bytes as hex for debug logs
pub fn hex_dump(data: &[u8], max_len: usize) -> String {
    let len = data.len().min(max_len);
    let hex: String = data[..len]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > max_len {
        format!("{} ... ({} bytes total)", hex, data.len())
    } else {
        format!("{} ({} bytes)", hex, data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        // Smoke test to ensure the public surface fits together
        let config = ConnectionConfig::default();
        assert_eq!(config.service, services::CGM_SERVICE);
        assert_eq!(config.receive_characteristic, services::RX_CHARACTERISTIC);
        let _ = ReceiverConfig::default();
        let _ = StreamReassembler::new();
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x01, 0x0A, 0xFF], 32), "01 0A FF (3 bytes)");
        assert_eq!(hex_dump(&[0x01, 0x0A, 0xFF], 2), "01 0A ... (3 bytes total)");
        assert_eq!(hex_dump(&[], 32), " (0 bytes)");
    }
}
