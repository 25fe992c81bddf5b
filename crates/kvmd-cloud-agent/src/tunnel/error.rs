//! Tunnel error types.

use std::io;

/// Errors that end a link attempt or fail a call made over a link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("unable to connect to {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("unable to register on {addr}: timeout")]
    RegistrationTimeout { addr: String },

    #[error("unable to register on {addr}: malformed response {detail}")]
    MalformedResponse { addr: String, detail: String },

    #[error("registration on {addr} is already in progress")]
    RegistrationInProgress { addr: String },

    #[error("events stream is not open")]
    NotRegistered,

    /// The stream of a channel was already consumed by a previous handshake
    /// or serve loop.
    #[error("events stream of {addr} is no longer available")]
    StreamUnavailable { addr: String },

    /// Clean end of stream from the peer.
    #[error("stream closed by {addr}")]
    TransportClosed { addr: String },

    #[error("transport error on {addr}: {reason}")]
    Transport { addr: String, reason: String },

    /// A unary call failed. Displays the server message verbatim.
    #[error("{message}")]
    Rpc {
        method: &'static str,
        code: tonic::Code,
        message: String,
    },

    #[error("proxy list is empty")]
    NoRelays,

    #[error("not connected to hive")]
    NotConnected,

    #[error("link cancelled")]
    Cancelled,

    #[error("invalid link configuration: {0}")]
    Config(String),
}

impl LinkError {
    pub(crate) fn rpc(method: &'static str, status: &tonic::Status) -> Self {
        Self::Rpc {
            method,
            code: status.code(),
            message: status.message().to_string(),
        }
    }

    pub(crate) fn transport(addr: &str, status: &tonic::Status) -> Self {
        Self::Transport {
            addr: addr.to_string(),
            reason: status.to_string(),
        }
    }

    /// Whether this error is a clean termination rather than a failure.
    pub const fn is_clean_close(&self) -> bool {
        matches!(self, Self::TransportClosed { .. } | Self::Cancelled)
    }
}

/// Errors of a single virtual connection. Reported to the proxy as an ERROR
/// event; they never end the link.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("empty connection target")]
    EmptyTarget,

    #[error("unable to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to {target} timed out")]
    DialTimeout { target: String },

    #[error("unix socket targets are not supported on this platform: {target}")]
    UnsupportedTarget { target: String },

    #[error("connection {cid} already exists")]
    Duplicate { cid: String },

    #[error("unable to open data stream for {cid}: {reason}")]
    Stream { cid: String, reason: String },

    #[error("new connections are not accepted on this link")]
    NotAccepted,
}
