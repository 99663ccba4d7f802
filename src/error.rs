//! Error types for Perun.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for Perun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Perun.
#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // Store errors
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Protocol parsing and state-machine errors.
///
/// Each variant corresponds to a distinct on-wire response: malformed input
/// is dropped, admission and credential failures are NAKed, and state
/// violations are NAKed without touching the session.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unknown command signature: {0}")]
    UnknownCommand(String),

    #[error("unknown repeater: {0}")]
    UnknownRepeater(u32),

    #[error("bad credential for repeater {0}")]
    BadCredential(u32),

    #[error("repeater {id}: {command} not valid in state {state}")]
    WrongState {
        id: u32,
        state: String,
        command: String,
    },
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),
}

/// Session store and registry errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("session not found: {0}")]
    SessionNotFound(u32),
}

impl Error {
    /// Check if the error is fatal for the server as a whole.
    ///
    /// Only a failed bind at startup stops the server; every per-packet
    /// failure is logged and swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(TransportError::BindFailed { .. }))
    }
}
