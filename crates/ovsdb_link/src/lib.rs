//! OVSDB wire layer.
//!
//! This crate implements the RFC 7047 side of the replica client: the tagged
//! column-value representation and its wire encoding, the database schema
//! model (including the defaults synthesized for absent columns), the
//! transact/monitor operation shapes, and an async JSON-RPC transport with
//! pending-call correlation and a single-consumer notification queue. Higher
//! layers supply caching, failover, and the typed entity surface.

pub mod codec;
pub mod error;
pub mod ops;
pub mod schema;
pub mod transport;
pub mod value;

pub use error::Error;
pub use transport::{Endpoint, Notification, Scheme, Transport};
pub use value::{Row, Value};

// TLS configs are built by callers; re-exported so they need no separate
// rustls version pin.
pub use tokio_rustls::rustls;
