//! Synchronized client for the OVN northbound and southbound databases.
//!
//! The client keeps a continuously updated in-memory replica of the remote
//! tables: it connects to the first healthy endpoint of a cluster, streams
//! monitor updates into a per-table cache, and resumes from its last seen
//! transaction id after a reconnect. Reads are answered from the replica;
//! writes go through command builders committed as one atomic `transact`.
//!
//! ```no_run
//! use ovn_client::{Client, Config};
//!
//! # async fn demo() -> Result<(), ovn_client::Error> {
//! let client = Client::connect(Config::new(
//!     ovn_client::DB_NORTHBOUND,
//!     "tcp:10.0.0.1:6641,tcp:10.0.0.2:6641",
//! ))
//! .await?;
//! let cmd = client.ls_add("ls0").await?;
//! client.execute([cmd]).await?;
//! for ls in client.ls_list().await {
//!     println!("{}", ls.name);
//! }
//! # Ok(())
//! # }
//! ```

mod apply;
mod cache;
mod client;
mod config;
mod error;
mod nb;
mod signal;
mod txn;

pub use client::Client;
pub use config::{Config, DB_NORTHBOUND, DB_SERVER, DB_SOUTHBOUND, ZERO_TXN};
pub use error::Error;
pub use nb::{
    Acl, AddressSet, LoadBalancer, LogicalRouter, LogicalRouterPort, LogicalSwitch,
    LogicalSwitchPort,
};
pub use signal::SignalHandler;
pub use txn::Command;

pub use ovsdb_link::{rustls, Endpoint, Row, Scheme, Value};
