use std::time::Duration;

use thiserror::Error;

/// Error from an outgoing call.
///
/// Expected conditions (link down, peer rejection, mid-call disconnect) are
/// returned as values from [`Client::call`](crate::Client::call); the variants
/// carry enough text for the caller to decide whether to retry, reconnect, or
/// surface the failure to the operator.
#[derive(Debug, Error)]
pub enum CallError {
    /// The client has been disposed; no further calls are possible.
    #[error("client has been disposed")]
    Disposed,

    /// No connection is established; the call was rejected before any I/O.
    #[error("not connected to the simulation server")]
    NotConnected,

    /// The request envelope could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] EncodeError),

    /// Writing the outbound frame failed; the link is likely dead.
    #[error("transport write failed: {0}")]
    Transport(#[source] std::io::Error),

    /// The peer answered with an error payload.
    #[error("remote error: {0}")]
    Remote(String),

    /// The response payload did not deserialize into the requested type.
    #[error("failed to decode response payload: {0}")]
    Decode(String),

    /// The connection ended before a response arrived for this call.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
}

/// Error from a connect attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The client has been disposed; it cannot be reconnected.
    #[error("client has been disposed")]
    Disposed,

    /// Another connect attempt is already in flight; this one was rejected
    /// rather than interleaved with it.
    #[error("another connect attempt is already in progress")]
    AlreadyConnecting,

    /// The attempt did not complete within the deadline. Any partially opened
    /// transport has been dropped and the client is Disconnected.
    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The transport could not be opened (refused, unreachable, ...).
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Error encoding a request envelope or one of its parameters.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode request envelope: {0}")]
    Envelope(#[from] rmp_serde::encode::Error),

    #[error("failed to encode call parameter: {0}")]
    Param(String),
}

/// Error decoding inbound bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The byte stream no longer parses as MessagePack. Since frames are
    /// self-delimiting there is no way to resynchronize; the connection must
    /// be torn down.
    #[error("corrupt frame stream: {0}")]
    Corrupt(String),

    /// A frame parsed as MessagePack but not as a response envelope.
    #[error("malformed response envelope: {0}")]
    Envelope(String),
}
