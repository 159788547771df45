//! Wire codec and packet type registry.
//!
//! Every datagram is ASCII-framed text:
//!
//! ```text
//! plain:      TT payload
//! sequenced:  TT SSSSS payload
//! ```
//!
//! `TT` is the two-digit decimal type identifier and `SSSSS` a zero-padded
//! five-digit sequence number. Whether a frame carries the sequence field is
//! decided by its kind (see [`PacketKind::is_sequenced`]), so the decoder never
//! has to guess. Payload sub-fields are separated by [`DELIMITER`].
//!
//! Decoding is total: anything that cannot be parsed becomes an
//! [`PacketKind::Invalid`] packet carrying the raw content for diagnostics.

use crate::error::ProtocolError;
use crate::{DELIMITER, MAX_IDENTITY_LEN, SEQUENCE_MODULUS, SEQUENCE_WIDTH, TYPE_TAG_WIDTH};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Decode-only marker for malformed input. Never transmitted.
    Invalid,
    Ack,
    NegAck,
    SessionEnd,
    Join,
    Leave,
    Chat,
    StateUpdate,
    Spawn,
    Remove,
}

impl PacketKind {
    /// Every kind that may appear on the wire.
    pub const TRANSMITTABLE: [PacketKind; 9] = [
        PacketKind::Ack,
        PacketKind::NegAck,
        PacketKind::SessionEnd,
        PacketKind::Join,
        PacketKind::Leave,
        PacketKind::Chat,
        PacketKind::StateUpdate,
        PacketKind::Spawn,
        PacketKind::Remove,
    ];

    pub fn id(self) -> i32 {
        match self {
            PacketKind::Invalid => -1,
            PacketKind::Ack => 0,
            PacketKind::NegAck => 1,
            PacketKind::SessionEnd => 2,
            PacketKind::Join => 3,
            PacketKind::Leave => 4,
            PacketKind::Chat => 5,
            PacketKind::StateUpdate => 6,
            PacketKind::Spawn => 7,
            PacketKind::Remove => 8,
        }
    }

    /// Resolves a numeric identifier. Unknown identifiers map to `Invalid`.
    pub fn from_id(id: i32) -> Self {
        match id {
            0 => PacketKind::Ack,
            1 => PacketKind::NegAck,
            2 => PacketKind::SessionEnd,
            3 => PacketKind::Join,
            4 => PacketKind::Leave,
            5 => PacketKind::Chat,
            6 => PacketKind::StateUpdate,
            7 => PacketKind::Spawn,
            8 => PacketKind::Remove,
            _ => PacketKind::Invalid,
        }
    }

    /// Sequenced kinds carry the sequence field and are acknowledged by the
    /// receiver.
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            PacketKind::SessionEnd
                | PacketKind::Join
                | PacketKind::Leave
                | PacketKind::Chat
                | PacketKind::Spawn
                | PacketKind::Remove
        )
    }

    /// Kinds the game layer may send through `send_event`.
    pub fn is_application_event(self) -> bool {
        !matches!(
            self,
            PacketKind::Invalid | PacketKind::Ack | PacketKind::NegAck
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    /// Meaningful only for sequenced kinds; always 0 otherwise.
    pub sequence: u32,
    pub payload: String,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            sequence: 0,
            payload: payload.into(),
        }
    }

    /// Stamps a sequence number, reduced into the ring. Plain kinds ignore it.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        if self.kind.is_sequenced() {
            self.sequence = sequence % SEQUENCE_MODULUS;
        }
        self
    }

    pub fn invalid(raw: &[u8]) -> Self {
        Self::new(PacketKind::Invalid, String::from_utf8_lossy(raw))
    }

    pub fn is_valid(&self) -> bool {
        self.kind != PacketKind::Invalid
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = format!("{:02}", self.kind.id());
        if self.kind.is_sequenced() {
            frame.push_str(&format!("{:05}", self.sequence % SEQUENCE_MODULUS));
        }
        frame.push_str(&self.payload);
        frame.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Packet {
        let bytes = trim_padding(bytes);
        if bytes.len() < TYPE_TAG_WIDTH {
            return Packet::invalid(bytes);
        }

        let kind = match parse_digits(&bytes[..TYPE_TAG_WIDTH]) {
            Some(id) => PacketKind::from_id(id as i32),
            None => PacketKind::Invalid,
        };
        if kind == PacketKind::Invalid {
            return Packet::invalid(bytes);
        }

        let mut offset = TYPE_TAG_WIDTH;
        let mut sequence = 0;
        if kind.is_sequenced() {
            let end = offset + SEQUENCE_WIDTH;
            match bytes.get(offset..end).and_then(parse_digits) {
                Some(value) => sequence = value,
                None => return Packet::invalid(bytes),
            }
            offset = end;
        }

        match std::str::from_utf8(&bytes[offset..]) {
            Ok(payload) => Packet {
                kind,
                sequence,
                payload: payload.to_string(),
            },
            Err(_) => Packet::invalid(bytes),
        }
    }

    /// Splits the payload into its delimiter-separated sub-fields.
    pub fn fields(&self) -> Vec<&str> {
        self.payload.split(DELIMITER).collect()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_sequenced() {
            write!(f, "{:?}#{:05}({})", self.kind, self.sequence, self.payload)
        } else {
            write!(f, "{:?}({})", self.kind, self.payload)
        }
    }
}

/// Receivers may hand over a buffer with trailing NUL padding.
pub fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

fn parse_digits(field: &[u8]) -> Option<u32> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(
        field
            .iter()
            .fold(0u32, |acc, digit| acc * 10 + u32::from(digit - b'0')),
    )
}

/// Content fingerprint of an encoded frame (32-bit FNV-1a).
///
/// Acknowledgments echo the receipt of the frame they acknowledge so that an
/// acknowledgment cannot be matched against a different packet that happens to
/// reuse the sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(u32);

impl Receipt {
    pub fn of(frame: &[u8]) -> Self {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in trim_padding(frame) {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        Receipt(hash)
    }

    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u32::from_str_radix(text, 16).ok().map(Receipt)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Body of an Ack or NegAck: `SSSSS;RRRRRRRR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgment {
    pub sequence: u32,
    pub receipt: Receipt,
}

impl Acknowledgment {
    /// Acknowledgment for a received sequenced frame.
    pub fn for_frame(packet: &Packet, raw: &[u8]) -> Self {
        Self {
            sequence: packet.sequence,
            receipt: Receipt::of(raw),
        }
    }

    /// Builds the Ack (or NegAck) packet carrying this acknowledgment.
    pub fn to_packet(self, kind: PacketKind) -> Packet {
        debug_assert!(matches!(kind, PacketKind::Ack | PacketKind::NegAck));
        Packet::new(
            kind,
            format!("{:05}{}{}", self.sequence, DELIMITER, self.receipt),
        )
    }

    pub fn from_packet(packet: &Packet) -> Option<Self> {
        if !matches!(packet.kind, PacketKind::Ack | PacketKind::NegAck) {
            return None;
        }
        let (sequence, receipt) = packet.payload.split_once(DELIMITER)?;
        if sequence.len() != SEQUENCE_WIDTH {
            return None;
        }
        Some(Self {
            sequence: parse_digits(sequence.as_bytes())?,
            receipt: Receipt::parse(receipt)?,
        })
    }
}

/// Joins payload sub-fields, refusing any field that contains the delimiter.
pub fn join_fields(fields: &[&str]) -> Result<String, ProtocolError> {
    if let Some(bad) = fields.iter().find(|field| field.contains(DELIMITER)) {
        return Err(ProtocolError::ReservedDelimiter(bad.to_string()));
    }
    Ok(fields.join(&DELIMITER.to_string()))
}

pub fn validate_identity(identity: &str) -> Result<(), ProtocolError> {
    let valid = !identity.is_empty()
        && identity.chars().count() <= MAX_IDENTITY_LEN
        && identity.trim() == identity
        && !identity.contains(DELIMITER)
        && !identity.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidIdentity(identity.to_string()))
    }
}

pub fn chat_payload(identity: &str, message: &str) -> Result<String, ProtocolError> {
    join_fields(&[identity, message])
}

/// Splits a chat payload into `(identity, message)`.
pub fn parse_chat(payload: &str) -> Option<(&str, &str)> {
    payload.split_once(DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids_are_stable() {
        assert_eq!(PacketKind::Ack.id(), 0);
        assert_eq!(PacketKind::NegAck.id(), 1);
        assert_eq!(PacketKind::SessionEnd.id(), 2);
        assert_eq!(PacketKind::Join.id(), 3);
        assert_eq!(PacketKind::Leave.id(), 4);
        assert_eq!(PacketKind::Chat.id(), 5);
        assert_eq!(PacketKind::StateUpdate.id(), 6);
        assert_eq!(PacketKind::Spawn.id(), 7);
        assert_eq!(PacketKind::Remove.id(), 8);
        assert_eq!(PacketKind::Invalid.id(), -1);

        for kind in PacketKind::TRANSMITTABLE {
            assert_eq!(PacketKind::from_id(kind.id()), kind);
        }
    }

    #[test]
    fn test_unknown_ids_resolve_to_invalid() {
        for id in [-1, 9, 10, 42, 99, i32::MAX, i32::MIN] {
            assert_eq!(PacketKind::from_id(id), PacketKind::Invalid);
        }
    }

    #[test]
    fn test_plain_frame_layout() {
        let packet = Packet::new(PacketKind::StateUpdate, "x=1");
        assert_eq!(packet.encode(), b"06x=1".to_vec());
    }

    #[test]
    fn test_sequenced_frame_layout() {
        let packet = Packet::new(PacketKind::Join, "alice").with_sequence(42);
        assert_eq!(packet.encode(), b"0300042alice".to_vec());
    }

    #[test]
    fn test_roundtrip_every_kind() {
        let payloads = ["", "alice", "bob;hello there", "ünïcødé", "  spaced  "];
        for kind in PacketKind::TRANSMITTABLE {
            for (i, payload) in payloads.iter().enumerate() {
                let packet = Packet::new(kind, *payload).with_sequence(i as u32 * 31_337);
                let decoded = Packet::decode(&packet.encode());
                assert_eq!(decoded, packet, "roundtrip failed for {:?}", kind);
            }
        }
    }

    #[test]
    fn test_sequence_reduced_into_ring() {
        let packet = Packet::new(PacketKind::Chat, "").with_sequence(SEQUENCE_MODULUS + 7);
        assert_eq!(packet.sequence, 7);

        let plain = Packet::new(PacketKind::Ack, "").with_sequence(12);
        assert_eq!(plain.sequence, 0);
    }

    #[test]
    fn test_short_input_is_invalid() {
        for raw in [&b""[..], b"0", b"\0\0\0"] {
            assert_eq!(Packet::decode(raw).kind, PacketKind::Invalid);
        }
    }

    #[test]
    fn test_non_numeric_tag_is_invalid() {
        for raw in [&b"ab00001x"[..], b"-100001x", b"+3hello", b" 3hello", b"3a"] {
            let decoded = Packet::decode(raw);
            assert_eq!(decoded.kind, PacketKind::Invalid);
            assert_eq!(decoded.payload.as_bytes(), raw);
        }
    }

    #[test]
    fn test_unknown_tag_is_invalid() {
        let decoded = Packet::decode(b"42payload");
        assert_eq!(decoded.kind, PacketKind::Invalid);
        assert_eq!(decoded.payload, "42payload");
    }

    #[test]
    fn test_truncated_sequence_is_invalid() {
        assert_eq!(Packet::decode(b"03001").kind, PacketKind::Invalid);
        assert_eq!(Packet::decode(b"0300x12alice").kind, PacketKind::Invalid);
        assert_eq!(Packet::decode(b"03").kind, PacketKind::Invalid);
    }

    #[test]
    fn test_multibyte_prefix_does_not_panic() {
        let decoded = Packet::decode("é3000001".as_bytes());
        assert_eq!(decoded.kind, PacketKind::Invalid);
        let decoded = Packet::decode("03000é1".as_bytes());
        assert_eq!(decoded.kind, PacketKind::Invalid);
    }

    #[test]
    fn test_non_utf8_payload_is_invalid() {
        let decoded = Packet::decode(&[b'0', b'6', 0xff, 0xfe]);
        assert_eq!(decoded.kind, PacketKind::Invalid);
    }

    #[test]
    fn test_nul_padding_is_trimmed() {
        let mut buffer = Packet::new(PacketKind::Leave, "bob")
            .with_sequence(9)
            .encode();
        buffer.resize(64, 0);
        let decoded = Packet::decode(&buffer);
        assert_eq!(decoded.kind, PacketKind::Leave);
        assert_eq!(decoded.sequence, 9);
        assert_eq!(decoded.payload, "bob");
    }

    #[test]
    fn test_receipt_depends_on_content() {
        let a = Packet::new(PacketKind::Join, "alice").with_sequence(1).encode();
        let b = Packet::new(PacketKind::Join, "alicf").with_sequence(1).encode();
        assert_eq!(Receipt::of(&a), Receipt::of(&a));
        assert_ne!(Receipt::of(&a), Receipt::of(&b));

        let mut padded = a.clone();
        padded.extend_from_slice(&[0, 0, 0]);
        assert_eq!(Receipt::of(&a), Receipt::of(&padded));
    }

    #[test]
    fn test_receipt_text_form() {
        let receipt = Receipt::of(b"0300001alice");
        let text = receipt.to_string();
        assert_eq!(text.len(), 8);
        assert_eq!(Receipt::parse(&text), Some(receipt));
        assert_eq!(Receipt::parse("xyz"), None);
        assert_eq!(Receipt::parse("0000000g"), None);
        assert_eq!(Receipt::parse("+abcdef0"), None);
        assert_eq!(Receipt::parse("-0000001"), None);
    }

    #[test]
    fn test_acknowledgment_packet() {
        let packet = Packet::new(PacketKind::Chat, "alice;hi").with_sequence(77);
        let raw = packet.encode();
        let ack = Acknowledgment::for_frame(&packet, &raw);
        let ack_packet = ack.to_packet(PacketKind::Ack);

        assert_eq!(ack_packet.kind, PacketKind::Ack);
        assert!(ack_packet.payload.starts_with("00077;"));

        let decoded = Packet::decode(&ack_packet.encode());
        assert_eq!(Acknowledgment::from_packet(&decoded), Some(ack));
    }

    #[test]
    fn test_malformed_acknowledgment_rejected() {
        for payload in ["", "00001", "1;abcdef01", "00001;abc", "abcde;abcdef01"] {
            let packet = Packet::new(PacketKind::Ack, payload);
            assert_eq!(Acknowledgment::from_packet(&packet), None, "{}", payload);
        }
        let not_an_ack = Packet::new(PacketKind::Chat, "00001;abcdef01");
        assert_eq!(Acknowledgment::from_packet(&not_an_ack), None);
    }

    #[test]
    fn test_join_fields() {
        assert_eq!(join_fields(&["a", "b", "c"]).unwrap(), "a;b;c");
        assert!(matches!(
            join_fields(&["a", "b;c"]),
            Err(ProtocolError::ReservedDelimiter(field)) if field == "b;c"
        ));
    }

    #[test]
    fn test_chat_payload() {
        let payload = chat_payload("alice", "hello world").unwrap();
        assert_eq!(parse_chat(&payload), Some(("alice", "hello world")));
        assert!(chat_payload("alice", "semi;colon").is_err());
        assert_eq!(parse_chat("no-delimiter"), None);
    }

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("Player 7").is_ok());
        for bad in ["", " alice", "alice ", "a;b", "tab\there"] {
            assert!(validate_identity(bad).is_err(), "{:?} should be rejected", bad);
        }
        assert!(validate_identity(&"x".repeat(32)).is_ok());
        assert!(validate_identity(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_fields() {
        let packet = Packet::new(PacketKind::Chat, "alice;hi");
        assert_eq!(packet.fields(), vec!["alice", "hi"]);
    }
}
