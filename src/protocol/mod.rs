//! Controller link: framing, transport and the reconnecting client

pub mod backoff;
pub mod client;
pub mod message;
pub mod transport;

use std::time::Duration;
use thiserror::Error;

pub use backoff::ReconnectPolicy;
pub use client::{ConnectionSettings, ConnectionState, ProtocolClient};
pub use message::{InboundMessage, Message, OutboundMessage};
pub use transport::{TcpTransport, Transport};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("not connected to the controller")]
    NotConnected,

    #[error("connecting to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("controller I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty frame")]
    EmptyFrame,

    #[error("message is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
