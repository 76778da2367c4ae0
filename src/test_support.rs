//! Fixtures shared by the unit tests

use crate::crc;
use crate::messages::{FrameHeader, HistoryPageHeader, HistoryRecord};

/// A 534-byte glucose history page captured from a receiver: 26 records
/// starting at sequence 53808, padded with 0xFF to the page size.
const SAMPLE_HISTORY_HEX: &[&str] = &[
    "0116020130d200001a0000000402880500000000",
    "00000000000000000000fe4d02cf360ed77b360e",
    "590015596f2ed0360e037d360e5c001455025ad1",
    "360e2f7e360e6b00148d3586d2360e5b7f360e6c",
    "0013b91ab2d3360e8780360e670014501cded436",
    "0eb381360e68001416ec0ad6360edf82360e6a00",
    "1468ba37d7360e0b84360e680014c36262d8360e",
    "3785360e5b0014277e8ed9360e6386360e4e0015",
    "add8bada360e8f87360e43001678bae6db360ebb",
    "88360e3b0016fd1b12dd360ee789360e36001553",
    "843ede360e138b360e370014202e6adf360e3f8c",
    "360e34001446ac96e0360e6b8d360e3500145ccf",
    "c2e1360e978e360e350014a553eee2360ec38f36",
    "0e39001449a01ae4360eee90360e3e0014626e46",
    "e5360e1a92360e400014114572e6360e4693360e",
    "480014230e9ee7360e7294360e4b0014f0fccae8",
    "360e9e95360e4b0014c6e5f6e9360eca96360e59",
    "009437df22eb360ef697360e580094ceb122eb36",
    "0ef797360e588014bf83ffffffffffffffffffff",
    "ffffffffffffffffffffffffffffffffffffffff",
    "ffffffffffffffffffffffffffffffffffffffff",
    "ffffffffffffffffffffffffffffffffffffffff",
    "ffffffffffffffffffffffffffffffffffffffff",
    "ffffffffffffffffffffffffffffffffffffffff",
    "ffffffffffffffffffffffffffffffffffffffff",
    "ffffffffffffffffffffffffffffffffffffffff",
    "ffffffffffffffffffffffff6d52",
];

/// Device clock reading just after the last sample record
pub const SAMPLE_CLOCK_SECONDS: u32 = 238_480_500;

pub fn hex_to_bytes(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

pub fn sample_history() -> Vec<u8> {
    hex_to_bytes(&SAMPLE_HISTORY_HEX.concat())
}

fn frame(body: &[u8]) -> Vec<u8> {
    let total = (FrameHeader::LENGTH + body.len() + crc::CRC_LENGTH) as u16;
    let mut data = vec![0x01];
    data.extend_from_slice(&total.to_le_bytes());
    data.push(0x01);
    data.extend_from_slice(body);
    crc::append_crc(&mut data);
    data
}

/// A checksum-valid clock message
pub fn clock_message(device_seconds: u32) -> Vec<u8> {
    frame(&device_seconds.to_le_bytes())
}

/// A checksum-valid history page holding exactly `records`, each given
/// as (system time, display time, glucose word, trend byte)
pub fn history_page(first_index: u32, records: &[(u32, u32, u16, u8)]) -> Vec<u8> {
    let mut header = Vec::with_capacity(HistoryPageHeader::LENGTH);
    header.extend_from_slice(&first_index.to_le_bytes());
    header.extend_from_slice(&(records.len() as u32).to_le_bytes());
    header.push(4);
    header.push(2);
    header.extend_from_slice(&7u32.to_le_bytes());
    header.extend_from_slice(&[0u8; 12]);
    crc::append_crc(&mut header);

    let mut body = header;
    for &(system_time, display_time, glucose, trend) in records {
        let mut record = Vec::with_capacity(HistoryRecord::LENGTH);
        record.extend_from_slice(&system_time.to_le_bytes());
        record.extend_from_slice(&display_time.to_le_bytes());
        record.extend_from_slice(&glucose.to_le_bytes());
        record.push(trend);
        crc::append_crc(&mut record);
        body.extend_from_slice(&record);
    }

    frame(&body)
}
