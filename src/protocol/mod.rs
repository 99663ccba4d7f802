//! Wire protocol for the Home-Brew (MMDVM) repeater link.
//!
//! Defines the command signatures, the voice burst format, and the fixed
//! configuration layout.
//!
//! ## Voice Burst Format (DMRD)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ "DMRD" (4) │ Seq (1) │ Src (3) │ Dst (3) │ Repeater (4) │ Bits(1)│
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Stream ID (4) │          DMR Payload (33)        │ BER │ RSSI    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Radio ids are 24-bit in voice bursts and 32-bit in session commands;
//! the codec preserves that asymmetry. All multibyte integers are
//! big-endian.

mod command;
mod packet;

pub use command::{ack, close, nak, pong, radio_id_at, Command, RptcConfig};
pub use packet::{DmrPacket, FrameType, Timeslot, DTYPE_VOICE_HEADER, DTYPE_VOICE_TERMINATOR};

/// Largest datagram the protocol defines (the RPTC configuration packet).
pub const MAX_DATAGRAM: usize = 302;

/// Voice burst size without the link-quality trailer.
pub const DMRD_SIZE: usize = 53;

/// Voice burst size with the BER/RSSI trailer.
pub const DMRD_SIZE_QUALITY: usize = 55;

/// Shortest datagram carrying a command signature.
pub const MIN_DATAGRAM: usize = 4;
