//! Transport-level errors.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// The byte stream or a decoded message violated the wire format.
    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    /// The server answered the call with a non-null error member.
    #[error("{method} rpc failed: {message}")]
    Rpc { method: String, message: String },

    #[error("{method} rpc timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The connection is gone; the pending call can never complete.
    #[error("connection closed")]
    Closed,
}
