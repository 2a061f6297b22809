//! Error types for sockws

use std::io;
use thiserror::Error;

/// Main error type for sockws
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or short frame, or a magic tag mismatch
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SOCKS5 greeting carried a version other than 5
    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// SOCKS5 request used an address type we cannot parse
    #[error("unsupported address type: {0:#04x}")]
    AddressTypeUnsupported(u8),

    /// Outbound TCP dial failed
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Transport upgrade refused by the auth gate
    #[error("authentication failed")]
    AuthFailed,

    #[error("timed out")]
    Timeout,

    /// Could not establish the transport connection
    #[error("transport connection failed: {0}")]
    Transport(String),

    /// The transport session is gone
    #[error("transport session closed")]
    SessionClosed,

    #[error("tunnel {0:016x} is not open")]
    TunnelNotOpen(u64),

    /// The egress node did not acknowledge an OPEN in time
    #[error("tunnel {0:016x} was not opened by the egress node")]
    TunnelOpenFailed(u64),

    /// OPEN payloads carry a one-byte host length
    #[error("host name too long ({0} bytes, max 255)")]
    HostTooLong(usize),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type alias for sockws
pub type Result<T> = std::result::Result<T, Error>;
