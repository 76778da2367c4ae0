//! GATT identifiers exposed by the G4 Share receiver

use uuid::Uuid;

/// Receiver CGM service
pub const CGM_SERVICE: Uuid = Uuid::from_u128(0xF0ACA0B1_EBFA_F96F_28DA_076C35A521DB);

/// Device Information service (model/manufacturer strings, unused by the link)
pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x00001804_0000_1000_8000_00805F9B34FB);

/// Host to receiver (read/write)
pub const TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0xF0ACB20A_EBFA_F96F_28DA_076C35A521DB);

/// Receiver to host (read/indicate); carries the framed messages
pub const RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0xF0ACB20B_EBFA_F96F_28DA_076C35A521DB);

/// Authentication (read/write)
pub const AUTH_CHARACTERISTIC: Uuid = Uuid::from_u128(0xF0ACACAC_EBFA_F96F_28DA_076C35A521DB);

/// Heartbeat (read/notify); fires periodically while the receiver is awake
pub const HEARTBEAT_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xF0AC2B18_EBFA_F96F_28DA_076C35A521DB);

const KNOWN: [(Uuid, &str); 6] = [
    (CGM_SERVICE, "CGM Service"),
    (DEVICE_INFO_SERVICE, "Device Information"),
    (TX_CHARACTERISTIC, "Tx"),
    (RX_CHARACTERISTIC, "Rx"),
    (AUTH_CHARACTERISTIC, "Auth"),
    (HEARTBEAT_CHARACTERISTIC, "Heartbeat"),
];

/// Human-readable name for a known identifier
pub fn name_of(uuid: &Uuid) -> Option<&'static str> {
    KNOWN
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
}

/// Short label for log lines: the known name or the hyphenated UUID
pub fn label(uuid: &Uuid) -> String {
    name_of(uuid)
        .map(str::to_string)
        .unwrap_or_else(|| uuid.hyphenated().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            CGM_SERVICE.hyphenated().to_string().to_uppercase(),
            "F0ACA0B1-EBFA-F96F-28DA-076C35A521DB"
        );
        assert_eq!(
            RX_CHARACTERISTIC.hyphenated().to_string().to_uppercase(),
            "F0ACB20B-EBFA-F96F-28DA-076C35A521DB"
        );
        assert_eq!(
            DEVICE_INFO_SERVICE.hyphenated().to_string(),
            "00001804-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(label(&RX_CHARACTERISTIC), "Rx");
        assert_eq!(label(&HEARTBEAT_CHARACTERISTIC), "Heartbeat");
        let other = Uuid::from_u128(1);
        assert_eq!(name_of(&other), None);
        assert_eq!(label(&other), "00000000-0000-0000-0000-000000000001");
    }
}
