//! Client configuration and database constants.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ovsdb_link::{rustls, Endpoint};

use crate::error::Error;
use crate::signal::SignalHandler;

pub const DB_NORTHBOUND: &str = "OVN_Northbound";
pub const DB_SOUTHBOUND: &str = "OVN_Southbound";
/// Server metadata database carrying cluster status; monitored internally,
/// never a valid primary target.
pub const DB_SERVER: &str = "_Server";

/// Cursor value meaning "no transaction seen yet"; a server answering with
/// it has no history to resume from.
pub const ZERO_TXN: &str = "00000000-0000-0000-0000-000000000000";

pub const TABLE_LOGICAL_SWITCH: &str = "Logical_Switch";
pub const TABLE_LOGICAL_SWITCH_PORT: &str = "Logical_Switch_Port";
pub const TABLE_ACL: &str = "ACL";
pub const TABLE_ADDRESS_SET: &str = "Address_Set";
pub const TABLE_LOAD_BALANCER: &str = "Load_Balancer";
pub const TABLE_LOGICAL_ROUTER: &str = "Logical_Router";
pub const TABLE_LOGICAL_ROUTER_PORT: &str = "Logical_Router_Port";
pub const TABLE_CHASSIS: &str = "Chassis";
pub const TABLE_CHASSIS_PRIVATE: &str = "Chassis_Private";
pub const TABLE_ENCAP: &str = "Encap";
pub const TABLE_DATABASE: &str = "Database";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tables replicated by default for each database. Entries missing from a
/// particular server's schema are silently skipped.
pub(crate) fn builtin_tables(db: &str) -> &'static [&'static str] {
    match db {
        DB_NORTHBOUND => &[
            TABLE_LOGICAL_SWITCH,
            TABLE_LOGICAL_SWITCH_PORT,
            TABLE_ACL,
            TABLE_ADDRESS_SET,
            TABLE_LOAD_BALANCER,
            TABLE_LOGICAL_ROUTER,
            TABLE_LOGICAL_ROUTER_PORT,
        ],
        DB_SOUTHBOUND => &[TABLE_CHASSIS, TABLE_CHASSIS_PRIVATE, TABLE_ENCAP],
        DB_SERVER => &[TABLE_DATABASE],
        _ => &[],
    }
}

/// Everything needed to build a [`crate::Client`].
#[derive(Clone)]
pub struct Config {
    /// Database to replicate, [`DB_NORTHBOUND`] or [`DB_SOUTHBOUND`].
    pub db: String,
    /// Comma-separated endpoints, tried in order with a rotating cursor.
    pub addr: String,
    /// Client TLS configuration, required for `ssl:` endpoints.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Tables to replicate; empty means the built-in set for `db`. Column
    /// subsetting is not supported, so every value must be empty.
    pub table_cols: BTreeMap<String, Vec<String>>,
    /// Refuse endpoints that are not the raft leader for `db`.
    pub leader_only: bool,
    /// Applied to connection attempts and every RPC round trip.
    pub timeout: Duration,
    /// Reconnect (and resume the monitor) when the connection drops.
    pub reconnect: bool,
    /// Receiver for per-entity create/delete events.
    pub signal: Option<Arc<dyn SignalHandler>>,
}

impl Config {
    pub fn new(db: impl Into<String>, addr: impl Into<String>) -> Config {
        Config {
            db: db.into(),
            addr: addr.into(),
            tls: None,
            table_cols: BTreeMap::new(),
            leader_only: false,
            timeout: DEFAULT_TIMEOUT,
            reconnect: false,
            signal: None,
        }
    }

    pub fn tls(mut self, tls: Arc<rustls::ClientConfig>) -> Config {
        self.tls = Some(tls);
        self
    }

    pub fn tables(mut self, tables: BTreeMap<String, Vec<String>>) -> Config {
        self.table_cols = tables;
        self
    }

    pub fn leader_only(mut self, on: bool) -> Config {
        self.leader_only = on;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Config {
        self.timeout = timeout;
        self
    }

    pub fn reconnect(mut self, on: bool) -> Config {
        self.reconnect = on;
        self
    }

    pub fn signal(mut self, handler: Arc<dyn SignalHandler>) -> Config {
        self.signal = Some(handler);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.db != DB_NORTHBOUND && self.db != DB_SOUTHBOUND {
            return Err(Error::InvalidOption(format!(
                "database must be {DB_NORTHBOUND} or {DB_SOUTHBOUND}, not {:?}",
                self.db
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidOption("timeout must be non-zero".into()));
        }
        Ok(())
    }

    pub(crate) fn endpoints(&self) -> Result<Vec<Endpoint>, Error> {
        let mut endpoints = Vec::new();
        for entry in self.addr.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            endpoints.push(Endpoint::parse(entry)?);
        }
        if endpoints.is_empty() {
            return Err(Error::InvalidOption("no endpoints configured".into()));
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_list_splits_and_trims() {
        let cfg = Config::new(DB_NORTHBOUND, "tcp:a:6641, ssl:b:6641 ,tcp:c:6641");
        let eps = cfg.endpoints().unwrap();
        assert_eq!(eps.len(), 3);
        assert_eq!(eps[1].to_string(), "ssl:b:6641");
    }

    #[test]
    fn server_db_is_not_a_primary_target() {
        let cfg = Config::new(DB_SERVER, "tcp:a:6641");
        assert!(matches!(cfg.validate(), Err(Error::InvalidOption(_))));
    }

    #[test]
    fn empty_addr_is_rejected() {
        let cfg = Config::new(DB_NORTHBOUND, " , ");
        assert!(matches!(cfg.endpoints(), Err(Error::InvalidOption(_))));
    }
}
