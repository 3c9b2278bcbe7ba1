//! Duplex connection to the Gemini Live API
//!
//! ```text
//! Microphone frames ──▶ LiveSender ──▶ Transport (WebSocket) ──▶ service
//!                                             │
//!                 ServerEvent ◀── ServerMessage ◀┘
//! ```
//!
//! The connection layer only moves frames. Reconnects and recycling are
//! decided by the session state machine from the `Failure` classification
//! in `failure`.

pub mod client;
pub mod failure;
pub mod protocol;
pub mod transport;

pub use client::{LiveConfig, LiveConnection, LiveSender};
pub use failure::{Failure, FailureKind, PermanentCause, RetryPolicy};
pub use protocol::{ClientMessage, ServerEvent, ServerMessage, SetupConfig};
pub use transport::{
    CloseInfo, InboundFrame, OutboundFrame, ProxyConfig, Transport, TransportChannels,
    TransportError, WsTransport,
};

/// Errors opening a live connection
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LiveError {
    #[error("API key not configured. Set GEMINI_API_KEY or store a credential override.")]
    MissingApiKey,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Timed out waiting for session setup")]
    SetupTimeout,
    #[error("Connection closed during setup (code {code}): {reason}")]
    Closed {
        code: u16,
        reason: String,
        clean: bool,
    },
    #[error("Server error: {0}")]
    Server(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}
