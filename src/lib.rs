//! # Perun
//!
//! A self-contained DMR network server speaking the Home-Brew (MMDVM-style)
//! repeater protocol over UDP.
//!
//! Repeaters and hotspots register with the server, authenticate via a salted
//! challenge/response, exchange heartbeats, and forward voice bursts. The
//! server routes each burst to the peers subscribed to the destination
//! talkgroup, tracks in-progress calls for lastheard telemetry, and offers a
//! per-user parrot echo service.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        UDP Transport                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Packet Bus (incoming / outgoing / outgoing-noaddr)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   Session State Machine   │   Router   │ Call Tracker │ Parrot  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │       Session Store │ Repeater Registry │ Identity Snapshot     │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Radio ids read better unseparated
#![allow(clippy::cast_possible_truncation)]  // Intentional wire-width narrowing
#![allow(clippy::cast_sign_loss)]            // Link-quality math
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::cognitive_complexity)]      // Protocol state machines
#![allow(clippy::too_many_lines)]            // Complete handler implementations
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::match_same_arms)]           // Explicit arm per command is clearer

pub mod bus;
pub mod calls;
pub mod config;
pub mod error;
pub mod identdb;
pub mod parrot;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
pub mod transport;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default UDP port for the Home-Brew repeater protocol
pub const DEFAULT_DMR_PORT: u16 = 62031;

/// Reserved radio id of the parrot echo service
pub const DEFAULT_PARROT_ID: u32 = 9990;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus::{PacketBus, RawPacket};
    pub use crate::calls::{CallRecord, CallTracker};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::identdb::IdentDb;
    pub use crate::parrot::Parrot;
    pub use crate::protocol::{Command, DmrPacket, FrameType, Timeslot};
    pub use crate::registry::{Registry, RepeaterRecord};
    pub use crate::router::Router;
    pub use crate::server::DmrServer;
    pub use crate::store::{ConnectionState, RepeaterSession, SessionStore};
}
