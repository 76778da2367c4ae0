//! Receiver message decoding
//!
//! Every message starts with a 4-byte frame header and ends with a CRC-16.
//! The link only listens, so two message types matter: the system clock
//! reply and a page of glucose history. Anything else is dropped.
//!
//! History page layout:
//!
//! ```text
//! [frame header:4][page header:28][record:13] * recordCount [padding...][crc:2]
//! ```

use crate::clock;
use crate::crc::{self, CRC_LENGTH};
use crate::types::DecodeError;
use chrono::{DateTime, TimeDelta, Utc};

/// Decode result; rejections are silent drops upstream
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Start-of-frame marker (byte 0 of the frame header)
pub const FRAME_START: u8 = 0x01;

/// ACK marker (byte 3 of the frame header)
pub const FRAME_ACK: u8 = 0x01;

/// Record type tag for glucose (EGV) pages
pub const GLUCOSE_RECORD_TYPE: u8 = 4;

/// Page layout revision the decoder understands
pub const GLUCOSE_PAGE_REVISION: u8 = 2;

/// Mask for the glucose value in the record's 16-bit glucose word
pub const GLUCOSE_VALUE_MASK: u16 = 0x03FF;

/// Display-only flag in the record's 16-bit glucose word
pub const DISPLAY_ONLY_MASK: u16 = 0x8000;

/// Mask for the trend code in the record's trend byte
pub const TREND_MASK: u8 = 0x0F;

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn check_crc(data: &[u8]) -> DecodeResult<()> {
    match crc::checksums(data) {
        Some((stored, computed)) if stored == computed => Ok(()),
        Some((stored, computed)) => Err(DecodeError::ChecksumMismatch { stored, computed }),
        None => Err(DecodeError::TooShort(data.len())),
    }
}

fn check_length(data: &[u8], expected: usize) -> DecodeResult<()> {
    if data.len() != expected {
        return Err(DecodeError::WrongLength {
            expected,
            got: data.len(),
        });
    }
    Ok(())
}

/// Envelope preceding every message, declaring the total message length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the whole message, header and checksum included
    pub total_bytes: u16,
}

impl FrameHeader {
    //  0...0  start of frame (1)
    //  1...2  total bytes
    //  3...3  ACK (1)
    pub const LENGTH: usize = 4;

    pub fn parse(data: &[u8]) -> DecodeResult<Self> {
        check_length(data, Self::LENGTH)?;

        if data[0] != FRAME_START || data[3] != FRAME_ACK {
            return Err(DecodeError::BadFrameMarkers {
                start: data[0],
                ack: data[3],
            });
        }

        Ok(Self {
            total_bytes: read_u16(data, 1),
        })
    }

    /// Parse the header at the front of a longer chunk
    pub fn parse_prefix(data: &[u8]) -> DecodeResult<Self> {
        if data.len() < Self::LENGTH {
            return Err(DecodeError::TooShort(data.len()));
        }
        Self::parse(&data[..Self::LENGTH])
    }
}

/// Reply carrying the receiver's system clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockMessage {
    /// Seconds since the device epoch
    pub device_seconds: u32,
}

impl ClockMessage {
    //  0...3  frame header
    //  4...7  system time
    //  8...9  CRC
    pub const LENGTH: usize = 10;

    /// Decode a clock message received at `now`.
    ///
    /// Any 4-byte payload fits this shape, so the time must also land
    /// within `window` of `now` to count.
    pub fn parse(data: &[u8], now: DateTime<Utc>, window: TimeDelta) -> DecodeResult<Self> {
        check_length(data, Self::LENGTH)?;
        check_crc(data)?;

        let seconds = read_u32(data, 4);
        if !clock::is_plausible(seconds, now, window) {
            return Err(DecodeError::ImplausibleClock(seconds));
        }

        Ok(Self {
            device_seconds: seconds,
        })
    }

    /// The receiver's clock reinterpreted against the device epoch
    pub fn device_time(&self) -> DateTime<Utc> {
        clock::from_device_time(self.device_seconds)
    }
}

/// Header describing a page of consecutive history records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPageHeader {
    /// Sequence number of the first record in the page
    pub first_index: u32,
    pub record_count: u32,
    pub page_number: u32,
}

impl HistoryPageHeader {
    //  0...3  first index
    //  4...7  record count
    //  8...8  record type (4 == EGV)
    //  9...9  revision (2)
    // 10...13 page number
    // 14...25 reserved
    // 26...27 header CRC
    pub const LENGTH: usize = 28;

    pub fn parse(data: &[u8]) -> DecodeResult<Self> {
        check_length(data, Self::LENGTH)?;
        check_crc(data)?;

        let record_type = data[8];
        let revision = data[9];
        if record_type != GLUCOSE_RECORD_TYPE || revision != GLUCOSE_PAGE_REVISION {
            return Err(DecodeError::BadPageTags {
                record_type,
                revision,
            });
        }

        Ok(Self {
            first_index: read_u32(data, 0),
            record_count: read_u32(data, 4),
            page_number: read_u32(data, 10),
        })
    }
}

/// One glucose reading as stored in a history page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Assigned from the page header, not read from the record
    pub sequence: u32,
    /// Device clock seconds when the reading was taken
    pub system_time: u32,
    /// Device-epoch seconds as displayed on the receiver
    pub display_time: u32,
    pub glucose: u16,
    pub is_display_only: bool,
    pub trend: u8,
}

impl HistoryRecord {
    //  0...3  system time
    //  4...7  display time
    //  8...9  glucose (bits 0-9 value, bit 15 display only)
    // 10...10 trend (bits 0-3)
    // 11...12 CRC
    pub const LENGTH: usize = 13;

    pub fn parse(data: &[u8], sequence: u32) -> DecodeResult<Self> {
        check_length(data, Self::LENGTH)?;
        check_crc(data)?;

        let glucose_word = read_u16(data, 8);

        Ok(Self {
            sequence,
            system_time: read_u32(data, 0),
            display_time: read_u32(data, 4),
            glucose: glucose_word & GLUCOSE_VALUE_MASK,
            is_display_only: (glucose_word & DISPLAY_ONLY_MASK) != 0,
            trend: data[10] & TREND_MASK,
        })
    }

    /// Display time reinterpreted against the device epoch
    pub fn wall_time(&self) -> DateTime<Utc> {
        clock::from_device_time(self.display_time)
    }
}

/// A full page of glucose history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlucoseHistoryMessage {
    pub header: HistoryPageHeader,
    pub records: Vec<HistoryRecord>,
}

impl GlucoseHistoryMessage {
    const RECORDS_OFFSET: usize = FrameHeader::LENGTH + HistoryPageHeader::LENGTH;

    /// Decode a history page; any bad record rejects the whole page
    pub fn parse(data: &[u8]) -> DecodeResult<Self> {
        if data.len() <= Self::RECORDS_OFFSET {
            return Err(DecodeError::TooShort(data.len()));
        }
        check_crc(data)?;

        let header = HistoryPageHeader::parse(&data[FrameHeader::LENGTH..Self::RECORDS_OFFSET])?;

        // Records must fit between the page header and the message checksum
        let available = data.len() - CRC_LENGTH;
        let needed = (header.record_count as usize)
            .checked_mul(HistoryRecord::LENGTH)
            .and_then(|n| n.checked_add(Self::RECORDS_OFFSET))
            .unwrap_or(usize::MAX);
        if needed > available {
            return Err(DecodeError::Truncated { needed, available });
        }

        let records = (0..header.record_count)
            .map(|position| {
                let start = Self::RECORDS_OFFSET + HistoryRecord::LENGTH * position as usize;
                let slice = &data[start..start + HistoryRecord::LENGTH];
                let sequence = header.first_index.wrapping_add(position);
                HistoryRecord::parse(slice, sequence)
                    .map_err(|_| DecodeError::BadRecord { index: position })
            })
            .collect::<DecodeResult<Vec<_>>>()?;

        Ok(Self { header, records })
    }
}

/// Messages the link understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Clock(ClockMessage),
    GlucoseHistory(GlucoseHistoryMessage),
}

/// Classifies complete message buffers
pub struct MessageParser;

impl MessageParser {
    /// Try each decoder in priority order: clock first, then history.
    ///
    /// `now` is the receipt time used for the clock plausibility check.
    pub fn parse(data: &[u8], now: DateTime<Utc>, clock_window: TimeDelta) -> DecodeResult<Message> {
        let clock_err = match ClockMessage::parse(data, now, clock_window) {
            Ok(clock) => return Ok(Message::Clock(clock)),
            Err(err) => err,
        };

        match GlucoseHistoryMessage::parse(data) {
            Ok(history) => Ok(Message::GlucoseHistory(history)),
            // Clock-sized buffers are best explained by the clock decoder
            Err(_) if data.len() == ClockMessage::LENGTH => Err(clock_err),
            Err(DecodeError::TooShort(len)) => Err(DecodeError::Unrecognized(len)),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{clock_message, hex_to_bytes, history_page, sample_history};
    use chrono::TimeZone;

    fn sample_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 7, 23, 6, 40, 0).unwrap()
    }

    fn window() -> TimeDelta {
        TimeDelta::days(3650)
    }

    #[test]
    fn test_frame_header() {
        let header = FrameHeader::parse(&[0x01, 0x16, 0x02, 0x01]).unwrap();
        assert_eq!(header.total_bytes, 534);

        assert_eq!(
            FrameHeader::parse(&[0x02, 0x16, 0x02, 0x01]),
            Err(DecodeError::BadFrameMarkers {
                start: 0x02,
                ack: 0x01
            })
        );
        assert!(FrameHeader::parse(&[0x01, 0x16, 0x02, 0x00]).is_err());
        assert!(FrameHeader::parse(&[0x01, 0x16, 0x02]).is_err());
        assert!(FrameHeader::parse(&[0x01, 0x16, 0x02, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_frame_header_prefix() {
        let header = FrameHeader::parse_prefix(&[0x01, 0x0A, 0x00, 0x01, 0xFF, 0xFF]).unwrap();
        assert_eq!(header.total_bytes, 10);
        assert_eq!(
            FrameHeader::parse_prefix(&[0x01, 0x0A]),
            Err(DecodeError::TooShort(2))
        );
    }

    #[test]
    fn test_sample_history_page() {
        let data = sample_history();
        assert_eq!(data.len(), 534);

        let history = GlucoseHistoryMessage::parse(&data).unwrap();
        assert_eq!(history.header.first_index, 53808);
        assert_eq!(history.header.record_count, 26);
        assert_eq!(history.records.len(), 26);

        let first = &history.records[0];
        assert_eq!(first.sequence, 53808);
        assert_eq!(first.glucose, 89);
        assert_eq!(first.trend, 5);
        assert!(!first.is_display_only);
        assert_eq!(first.system_time, 238_472_962);
        assert_eq!(
            first.wall_time(),
            Utc.with_ymd_and_hms(2016, 7, 23, 4, 34, 31).unwrap()
        );

        let last = &history.records[25];
        assert_eq!(last.sequence, 53833);
        assert_eq!(last.glucose, 88);
        assert_eq!(last.trend, 4);
        assert!(last.is_display_only);
        assert_eq!(last.system_time, 238_480_162);
        assert_eq!(
            last.wall_time(),
            Utc.with_ymd_and_hms(2016, 7, 23, 6, 34, 31).unwrap()
        );
    }

    #[test]
    fn test_sequences_contiguous() {
        let history = GlucoseHistoryMessage::parse(&sample_history()).unwrap();
        for (position, record) in history.records.iter().enumerate() {
            assert_eq!(record.sequence, 53808 + position as u32);
        }
    }

    #[test]
    fn test_bad_final_crc_rejects_page() {
        let mut data = sample_history();
        // Final hex digit 2 -> 3, as in the receiver's own regression case
        let last = data.len() - 1;
        data[last] = 0x53;

        assert!(matches!(
            GlucoseHistoryMessage::parse(&data),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_record_rejects_page() {
        // Corrupt a record but keep the message checksum valid
        let mut data = sample_history();
        let record_start = FrameHeader::LENGTH + HistoryPageHeader::LENGTH + 3 * HistoryRecord::LENGTH;
        data[record_start + 8] ^= 0x01;
        let body_len = data.len() - CRC_LENGTH;
        let crc = crc::crc16(&data[..body_len]);
        data[body_len..].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(
            GlucoseHistoryMessage::parse(&data),
            Err(DecodeError::BadRecord { index: 3 })
        );
    }

    #[test]
    fn test_record_count_beyond_buffer() {
        let records: Vec<(u32, u32, u16, u8)> = vec![(1000, 900, 120, 4)];
        let mut data = history_page(500, &records);
        // Claim more records than the buffer holds, re-checksumming both levels
        let header_start = FrameHeader::LENGTH;
        data[header_start + 4..header_start + 8].copy_from_slice(&50u32.to_le_bytes());
        let header_crc = crc::crc16(&data[header_start..header_start + 26]);
        data[header_start + 26..header_start + 28].copy_from_slice(&header_crc.to_le_bytes());
        let body_len = data.len() - CRC_LENGTH;
        let crc = crc::crc16(&data[..body_len]);
        data[body_len..].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            GlucoseHistoryMessage::parse(&data),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_page_tags() {
        let data = sample_history();
        let mut header = data[4..32].to_vec();
        header[8] = 5;
        let crc = crc::crc16(&header[..26]);
        header[26..].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(
            HistoryPageHeader::parse(&header),
            Err(DecodeError::BadPageTags {
                record_type: 5,
                revision: 2
            })
        );
        assert!(HistoryPageHeader::parse(&data[4..32]).is_ok());
    }

    #[test]
    fn test_history_record_bitfields() {
        let mut record = Vec::new();
        record.extend_from_slice(&1000u32.to_le_bytes());
        record.extend_from_slice(&2000u32.to_le_bytes());
        // Value 1023 with display-only and stray bits 10-14 set
        record.extend_from_slice(&0xFFFFu16.to_le_bytes());
        record.push(0xF7);
        crc::append_crc(&mut record);

        let parsed = HistoryRecord::parse(&record, 42).unwrap();
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.glucose, 1023);
        assert!(parsed.is_display_only);
        assert_eq!(parsed.trend, 7);
        assert_eq!(parsed.system_time, 1000);
        assert_eq!(parsed.display_time, 2000);
    }

    #[test]
    fn test_clock_message() {
        let data = clock_message(238_480_500);
        let clock = ClockMessage::parse(&data, sample_now(), window()).unwrap();
        assert_eq!(clock.device_seconds, 238_480_500);
        assert_eq!(
            clock.device_time(),
            Utc.with_ymd_and_hms(2016, 7, 23, 12, 35, 0).unwrap()
        );
    }

    #[test]
    fn test_clock_message_rejections() {
        let mut bad_crc = clock_message(238_480_500);
        bad_crc[9] ^= 0xFF;
        assert!(matches!(
            ClockMessage::parse(&bad_crc, sample_now(), window()),
            Err(DecodeError::ChecksumMismatch { .. })
        ));

        // Valid checksum, but decades away from now
        let implausible = clock_message(0xF000_0000);
        assert_eq!(
            ClockMessage::parse(&implausible, sample_now(), window()),
            Err(DecodeError::ImplausibleClock(0xF000_0000))
        );

        let mut long = clock_message(238_480_500);
        long.push(0);
        assert!(matches!(
            ClockMessage::parse(&long, sample_now(), window()),
            Err(DecodeError::WrongLength { .. })
        ));
    }

    #[test]
    fn test_parser_priority() {
        let now = sample_now();
        assert_eq!(
            MessageParser::parse(&clock_message(238_480_500), now, window()),
            Ok(Message::Clock(ClockMessage {
                device_seconds: 238_480_500
            }))
        );

        match MessageParser::parse(&sample_history(), now, window()) {
            Ok(Message::GlucoseHistory(history)) => assert_eq!(history.records.len(), 26),
            other => panic!("Expected history message, got {:?}", other),
        }

        assert_eq!(
            MessageParser::parse(&clock_message(0xF000_0000), now, window()),
            Err(DecodeError::ImplausibleClock(0xF000_0000))
        );
        assert_eq!(
            MessageParser::parse(&hex_to_bytes("01060001a5b4"), now, window()),
            Err(DecodeError::Unrecognized(6))
        );
    }

    #[test]
    fn test_single_bit_flip_rejected() {
        let data = sample_history();
        // Only the populated part of the page: frame, page header and records
        let populated = FrameHeader::LENGTH + HistoryPageHeader::LENGTH + 26 * HistoryRecord::LENGTH;
        for byte in (0..populated).step_by(7) {
            for bit in [0, 3, 7] {
                let mut corrupted = data.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    GlucoseHistoryMessage::parse(&corrupted).is_err(),
                    "flip of byte {} bit {} accepted",
                    byte,
                    bit
                );
            }
        }
    }
}
