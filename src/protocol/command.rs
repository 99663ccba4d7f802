//! Command packet classification, reply construction, and the fixed RPTC
//! configuration layout.

use std::fmt;
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

use super::MAX_DATAGRAM;

/// Command packet kind, tagged by its leading ASCII signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Talker alias data from a repeater.
    DmrA,
    /// Voice/data burst.
    DmrD,
    /// Repeater login request.
    RptL,
    /// Authentication digest.
    RptK,
    /// Repeater configuration.
    RptC,
    /// Repeater closing the connection.
    RptCl,
    /// Options string (static talkgroup registration).
    RptO,
    /// Heartbeat.
    RptPing,
    /// Master acknowledgment (server-originated).
    RptAck,
    /// Site beacon.
    RptSbkn,
    /// Master close (server-originated).
    MstCl,
    /// Master negative acknowledgment (server-originated).
    MstNak,
    /// Heartbeat response (server-originated).
    MstPong,
}

impl Command {
    /// The on-wire signature for this command.
    pub const fn signature(self) -> &'static [u8] {
        match self {
            Command::DmrA => b"DMRA",
            Command::DmrD => b"DMRD",
            Command::RptL => b"RPTL",
            Command::RptK => b"RPTK",
            Command::RptC => b"RPTC",
            Command::RptCl => b"RPTCL",
            Command::RptO => b"RPTO",
            Command::RptPing => b"RPTPING",
            Command::RptAck => b"RPTACK",
            Command::RptSbkn => b"RPTSBKN",
            Command::MstCl => b"MSTCL",
            Command::MstNak => b"MSTNAK",
            Command::MstPong => b"MSTPONG",
        }
    }

    /// Classify a datagram by its leading signature.
    ///
    /// The first four bytes identify the command; `RPTC` vs `RPTCL` is
    /// disambiguated on the fifth byte and the `RPT*` family on longer
    /// prefixes, mirroring how repeater firmware emits them.
    pub fn classify(data: &[u8]) -> Result<Self> {
        let Some(signature) = data.first_chunk::<4>() else {
            return Err(
                ProtocolError::MalformedPacket(format!("{} bytes, need 4", data.len())).into(),
            );
        };

        let command = match signature {
            b"DMRA" => Command::DmrA,
            b"DMRD" => Command::DmrD,
            b"RPTL" => Command::RptL,
            b"RPTK" => Command::RptK,
            b"RPTO" => Command::RptO,
            b"RPTC" => {
                if data.len() >= 5 && data[4] == b'L' {
                    Command::RptCl
                } else {
                    Command::RptC
                }
            }
            b"RPTP" if data.len() >= 7 && data[..7] == *b"RPTPING" => Command::RptPing,
            b"RPTA" if data.len() >= 6 && data[..6] == *b"RPTACK" => Command::RptAck,
            b"RPTS" if data.len() >= 7 && data[..7] == *b"RPTSBKN" => Command::RptSbkn,
            b"MSTC" => Command::MstCl,
            b"MSTN" => Command::MstNak,
            b"MSTP" => Command::MstPong,
            other => {
                return Err(ProtocolError::UnknownCommand(
                    String::from_utf8_lossy(other).into_owned(),
                )
                .into())
            }
        };

        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.signature()))
    }
}

/// Build an `RPTACK` reply carrying an arbitrary payload (salt or radio id).
pub fn ack(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + payload.len());
    out.extend_from_slice(Command::RptAck.signature());
    out.extend_from_slice(payload);
    out
}

/// Build an `MSTNAK` reply for a radio id.
pub fn nak(radio_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(Command::MstNak.signature());
    out.extend_from_slice(&radio_id.to_be_bytes());
    out
}

/// Build an `MSTPONG` reply for a radio id.
pub fn pong(radio_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(11);
    out.extend_from_slice(Command::MstPong.signature());
    out.extend_from_slice(&radio_id.to_be_bytes());
    out
}

/// Build an `MSTCL` command for a radio id.
pub fn close(radio_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.extend_from_slice(Command::MstCl.signature());
    out.extend_from_slice(&radio_id.to_be_bytes());
    out
}

/// Read the 32-bit radio id a command carries at the given offset.
pub fn radio_id_at(data: &[u8], offset: usize) -> Result<u32> {
    if data.len() < offset + 4 {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} bytes, need {} for radio id",
            data.len(),
            offset + 4
        ))
        .into());
    }
    Ok(BigEndian::read_u32(&data[offset..offset + 4]))
}

/// Repeater configuration delivered by `RPTC`.
///
/// The packet is a fixed 302-byte layout of right-padded ASCII fields
/// following the signature and radio id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RptcConfig {
    pub callsign: String,
    pub rx_frequency: u32,
    pub tx_frequency: u32,
    pub tx_power: u16,
    pub color_code: u8,
    pub latitude: f32,
    pub longitude: f32,
    pub height: i32,
    pub location: String,
    pub description: String,
    pub slots: u8,
    pub url: String,
    pub software_id: String,
    pub package_id: String,
}

impl RptcConfig {
    /// Parse the configuration fields of a full `RPTC` datagram.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MAX_DATAGRAM {
            return Err(ProtocolError::MalformedPacket(format!(
                "RPTC is {} bytes, need {MAX_DATAGRAM}",
                data.len()
            ))
            .into());
        }

        Ok(Self {
            callsign: field_str(&data[8..16]),
            rx_frequency: field_num(&data[16..25], "rx_frequency")?,
            tx_frequency: field_num(&data[25..34], "tx_frequency")?,
            tx_power: field_num(&data[34..36], "tx_power")?,
            color_code: field_num(&data[36..38], "color_code")?,
            latitude: field_num(&data[38..46], "latitude")?,
            longitude: field_num(&data[46..55], "longitude")?,
            height: field_num(&data[55..58], "height")?,
            location: field_str(&data[58..78]),
            description: field_str(&data[78..97]),
            slots: field_num(&data[97..98], "slots")?,
            url: field_str(&data[98..222]),
            software_id: field_str(&data[222..262]),
            package_id: field_str(&data[262..302]),
        })
    }

    /// Encode into a full `RPTC` datagram. Used by tests and diagnostics.
    pub fn encode(&self, radio_id: u32) -> Vec<u8> {
        let mut out = vec![b' '; MAX_DATAGRAM];
        out[..4].copy_from_slice(Command::RptC.signature());
        BigEndian::write_u32(&mut out[4..8], radio_id);
        put_field(&mut out[8..16], &self.callsign);
        put_field(&mut out[16..25], &self.rx_frequency.to_string());
        put_field(&mut out[25..34], &self.tx_frequency.to_string());
        put_field(&mut out[34..36], &format!("{:02}", self.tx_power));
        put_field(&mut out[36..38], &format!("{:02}", self.color_code));
        put_field(&mut out[38..46], &format!("{:+08.4}", self.latitude));
        put_field(&mut out[46..55], &format!("{:+09.4}", self.longitude));
        put_field(&mut out[55..58], &format!("{:03}", self.height));
        put_field(&mut out[58..78], &self.location);
        put_field(&mut out[78..97], &self.description);
        put_field(&mut out[97..98], &self.slots.to_string());
        put_field(&mut out[98..222], &self.url);
        put_field(&mut out[222..262], &self.software_id);
        put_field(&mut out[262..302], &self.package_id);
        out
    }
}

fn field_str(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

fn field_num<T: FromStr>(raw: &[u8], name: &str) -> Result<T> {
    let text = field_str(raw);
    text.parse().map_err(|_| {
        ProtocolError::MalformedPacket(format!("unparseable {name}: {text:?}")).into()
    })
}

fn put_field(dst: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}
