//! Voice burst structure and codec.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ProtocolError, Result};

use super::{Command, DMRD_SIZE, DMRD_SIZE_QUALITY};

/// Data type carried by a data-sync frame: voice link-control header.
pub const DTYPE_VOICE_HEADER: u8 = 0x01;

/// Data type carried by a data-sync frame: voice terminator.
pub const DTYPE_VOICE_TERMINATOR: u8 = 0x02;

/// One of the two time-multiplexed channels a burst is carried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeslot {
    One,
    Two,
}

impl Timeslot {
    /// Decode from the slot bit of the packed bits byte.
    pub fn from_bit(set: bool) -> Self {
        if set {
            Timeslot::Two
        } else {
            Timeslot::One
        }
    }

    /// The slot bit value for this timeslot.
    pub fn bit(self) -> bool {
        matches!(self, Timeslot::Two)
    }

    /// The slot number (1 or 2).
    pub fn number(self) -> u8 {
        match self {
            Timeslot::One => 1,
            Timeslot::Two => 2,
        }
    }
}

impl fmt::Display for Timeslot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TS{}", self.number())
    }
}

/// Frame type of a voice burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Plain voice frame.
    Voice = 0,
    /// Voice frame carrying the sync pattern.
    VoiceSync = 1,
    /// Data-sync frame (headers, terminators, link control).
    DataSync = 2,
}

impl FrameType {
    pub fn from_bits(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Voice),
            1 => Some(Self::VoiceSync),
            2 => Some(Self::DataSync),
            _ => None,
        }
    }
}

/// A decoded DMR voice/data burst.
///
/// The wire form is 53 bytes, or 55 when the sender appends the BER/RSSI
/// link-quality trailer. Encoding always emits the trailer; decoding
/// accepts both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmrPacket {
    /// Per-stream sequence counter, wraps at 255.
    pub sequence: u8,
    /// Source radio id (24-bit on the wire).
    pub src: u32,
    /// Destination radio id or talkgroup (24-bit on the wire).
    pub dst: u32,
    /// Id of the repeater the burst is addressed to or originated from.
    pub repeater: u32,
    /// Timeslot the burst is carried on.
    pub slot: Timeslot,
    /// Group call (talkgroup destination) vs unit-to-unit call.
    pub group_call: bool,
    /// Frame type.
    pub frame_type: FrameType,
    /// Data type (data-sync frames) or voice sequence letter (voice frames).
    pub dtype_vseq: u8,
    /// Stream identifier shared by all bursts of one transmission.
    pub stream_id: u32,
    /// Raw DMR air-interface payload.
    pub payload: [u8; 33],
    /// Bit error rate byte (0 when the sender omits the trailer).
    pub ber: u8,
    /// Signal strength byte (0 when the sender omits the trailer).
    pub rssi: u8,
}

impl DmrPacket {
    /// Decode a `DMRD` datagram.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DMRD_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "DMRD is {} bytes, need {DMRD_SIZE}",
                data.len()
            ))
            .into());
        }

        if &data[..4] != Command::DmrD.signature() {
            return Err(ProtocolError::MalformedPacket(format!(
                "bad signature {:?}",
                String::from_utf8_lossy(&data[..4])
            ))
            .into());
        }

        let bits = data[15];
        let frame_type = FrameType::from_bits((bits >> 4) & 0x03).ok_or_else(|| {
            ProtocolError::MalformedPacket(format!("invalid frame type in bits {bits:#04x}"))
        })?;

        let mut payload = [0u8; 33];
        payload.copy_from_slice(&data[20..53]);

        let (ber, rssi) = if data.len() >= DMRD_SIZE_QUALITY {
            (data[53], data[54])
        } else {
            (0, 0)
        };

        Ok(Self {
            sequence: data[4],
            src: BigEndian::read_u24(&data[5..8]),
            dst: BigEndian::read_u24(&data[8..11]),
            repeater: BigEndian::read_u32(&data[11..15]),
            slot: Timeslot::from_bit(bits & 0x80 != 0),
            group_call: bits & 0x40 == 0,
            frame_type,
            dtype_vseq: bits & 0x0f,
            stream_id: BigEndian::read_u32(&data[16..20]),
            payload,
            ber,
            rssi,
        })
    }

    /// Encode to a `DMRD` datagram including the link-quality trailer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; DMRD_SIZE_QUALITY];
        out[..4].copy_from_slice(Command::DmrD.signature());
        out[4] = self.sequence;
        BigEndian::write_u24(&mut out[5..8], self.src & 0x00ff_ffff);
        BigEndian::write_u24(&mut out[8..11], self.dst & 0x00ff_ffff);
        BigEndian::write_u32(&mut out[11..15], self.repeater);
        out[15] = self.bits_byte();
        BigEndian::write_u32(&mut out[16..20], self.stream_id);
        out[20..53].copy_from_slice(&self.payload);
        out[53] = self.ber;
        out[54] = self.rssi;
        out
    }

    /// Pack slot, call type, frame type, and data type into the bits byte.
    fn bits_byte(&self) -> u8 {
        let mut bits = self.dtype_vseq & 0x0f;
        bits |= (self.frame_type as u8) << 4;
        if !self.group_call {
            bits |= 0x40;
        }
        if self.slot.bit() {
            bits |= 0x80;
        }
        bits
    }

    /// Is this burst a voice link-control header?
    pub fn is_voice_header(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_vseq == DTYPE_VOICE_HEADER
    }

    /// Is this burst a voice terminator?
    pub fn is_voice_terminator(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_vseq == DTYPE_VOICE_TERMINATOR
    }
}

impl fmt::Display for DmrPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream {:08x} seq {:3} {} {} -> {} via {} ({:?})",
            self.stream_id,
            self.sequence,
            self.slot,
            self.src,
            self.dst,
            self.repeater,
            self.frame_type,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DmrPacket {
        DmrPacket {
            sequence: 42,
            src: 3107001,
            dst: 91,
            repeater: 1234567,
            slot: Timeslot::Two,
            group_call: true,
            frame_type: FrameType::VoiceSync,
            dtype_vseq: 0x0a,
            stream_id: 0xdeadbeef,
            payload: [0x5a; 33],
            ber: 12,
            rssi: 47,
        }
    }

    #[test]
    fn test_roundtrip() {
        let packet = sample();
        let encoded = packet.encode();
        assert_eq!(encoded.len(), DMRD_SIZE_QUALITY);

        let decoded = DmrPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_unit_call_slot_one() {
        let mut packet = sample();
        packet.slot = Timeslot::One;
        packet.group_call = false;
        packet.frame_type = FrameType::DataSync;
        packet.dtype_vseq = DTYPE_VOICE_TERMINATOR;

        let decoded = DmrPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_voice_terminator());
        assert!(!decoded.group_call);
    }

    #[test]
    fn test_bits_byte_packing() {
        let packet = sample();
        let encoded = packet.encode();
        // TS2 slot bit set, group call bit clear, voice sync frame, vseq 0x0a
        assert_eq!(encoded[15], 0x80 | 0x10 | 0x0a);
    }

    #[test]
    fn test_decode_without_trailer() {
        let packet = sample();
        let mut encoded = packet.encode();
        encoded.truncate(DMRD_SIZE);

        let decoded = DmrPacket::decode(&encoded).unwrap();
        assert_eq!(decoded.ber, 0);
        assert_eq!(decoded.rssi, 0);
        assert_eq!(decoded.stream_id, packet.stream_id);
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_decode_short_is_malformed() {
        let packet = sample();
        let mut encoded = packet.encode();
        encoded.truncate(40);
        assert!(DmrPacket::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_bad_signature() {
        let mut encoded = sample().encode();
        encoded[..4].copy_from_slice(b"DMRA");
        assert!(DmrPacket::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_invalid_frame_type() {
        let mut encoded = sample().encode();
        encoded[15] = 0x30; // frame type 3 is undefined
        assert!(DmrPacket::decode(&encoded).is_err());
    }

    #[test]
    fn test_source_truncated_to_24_bits() {
        let mut packet = sample();
        packet.src = 0xff00_0001;
        let decoded = DmrPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.src, 0x0000_0001);
    }
}
