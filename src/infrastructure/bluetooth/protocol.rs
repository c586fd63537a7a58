//! HM-10 Switch Protocol
//!
//! This module contains the identifiers and the text vocabulary used to talk
//! to the switch peripheral over its single GATT characteristic, and the
//! identifiers of the RFCOMM key-exchange channel.

use crate::domain::models::ProtocolMessage;
use tracing::trace;
use uuid::Uuid;

/// HM-10 serial service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// HM-10 serial characteristic UUID - read, write and notify
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// RFCOMM service record used to open and to listen for the key channel
pub const KEY_EXCHANGE_UUID: Uuid = Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66);

/// Display name of the key-exchange service record
pub const KEY_EXCHANGE_NAME: &str = "HM10KeyExchange";

/// Name advertised by the switch peripheral, used by the auto-connect policy
pub const DEFAULT_DEVICE_NAME: &str = "DSSCSA_8";

/// Default scan duration in milliseconds
pub const SCAN_PERIOD_MS: u64 = 10_000;

/// Key handshake wire tokens
pub mod handshake {
    /// Responder asks for the token to be confirmed
    pub const GET: &str = "GET";
    /// Initiator confirms the handoff
    pub const DONE: &str = "DONE";
}

/// Serialize a message to the ASCII text written on the characteristic.
///
/// ```text
/// On    -> "On"
/// Off   -> "Off"
/// Auth  -> "Auth"
/// Ready -> "Ready"
/// Query -> "?"
/// ```
///
/// `Unknown` is written back verbatim.
pub fn encode(message: &ProtocolMessage) -> Vec<u8> {
    message.to_string().into_bytes()
}

/// Decode a characteristic payload. Never fails: anything outside the
/// vocabulary comes back as [`ProtocolMessage::Unknown`].
///
/// The payload is read as a string from offset 0; invalid UTF-8 sequences are
/// replaced rather than rejected, and a single trailing CR/LF (sent by some
/// HM-10 firmwares) is ignored.
pub fn decode(bytes: &[u8]) -> ProtocolMessage {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end_matches(['\r', '\n']);

    let message = match trimmed {
        "On" => ProtocolMessage::On,
        "Off" => ProtocolMessage::Off,
        "Auth" => ProtocolMessage::Auth,
        "Ready" => ProtocolMessage::Ready,
        "?" => ProtocolMessage::Query,
        _ => ProtocolMessage::Unknown(text.to_string()),
    };

    trace!("Decoded {:02X?} as {:?}", bytes, message);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCABULARY: [ProtocolMessage; 5] = [
        ProtocolMessage::On,
        ProtocolMessage::Off,
        ProtocolMessage::Auth,
        ProtocolMessage::Ready,
        ProtocolMessage::Query,
    ];

    #[test]
    fn test_vocabulary_round_trips() {
        for message in VOCABULARY {
            assert_eq!(decode(&encode(&message)), message);
        }
    }

    #[test]
    fn test_wire_text() {
        assert_eq!(encode(&ProtocolMessage::On), b"On");
        assert_eq!(encode(&ProtocolMessage::Query), b"?");
    }

    #[test]
    fn test_unrecognized_text_is_unknown() {
        assert_eq!(decode(b"O"), ProtocolMessage::Unknown("O".to_string()));
        assert_eq!(decode(b"on"), ProtocolMessage::Unknown("on".to_string()));
        assert_eq!(decode(b""), ProtocolMessage::Unknown(String::new()));
    }

    #[test]
    fn test_invalid_utf8_is_unknown() {
        assert!(matches!(decode(&[0xFF, 0xFE, 0x00]), ProtocolMessage::Unknown(_)));
    }

    #[test]
    fn test_trailing_newline_ignored() {
        assert_eq!(decode(b"Ready\r\n"), ProtocolMessage::Ready);
    }

    #[test]
    fn test_uuid_constants() {
        assert_eq!(SERVICE_UUID.to_string(), "0000ffe0-0000-1000-8000-00805f9b34fb");
        assert_eq!(
            CHARACTERISTIC_UUID.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }
}
