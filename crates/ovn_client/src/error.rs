//! Client-level errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No endpoint accepted the session, or there is no live connection.
    #[error("connection: {0}")]
    Connection(String),

    /// Unknown table or column, or an unsupported monitor configuration.
    #[error("schema: {0}")]
    Schema(String),

    /// No cached row matches the lookup.
    #[error("row not found")]
    NotFound,

    /// A name that had to be unique was not.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// The server rejected the batch; none of its operations took effect.
    #[error("transaction failed {0}")]
    Transaction(String),

    /// The reply did not have one result per operation.
    #[error("non-conformant transact reply: {0}")]
    Conformance(String),

    /// A builder was called with empty or inconsistent arguments.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error(transparent)]
    Rpc(#[from] ovsdb_link::Error),
}
