//! Typed northbound entities and their command builders.
//!
//! Every read decodes straight out of the replica under its read lock.
//! Every mutation returns an inert [`Command`] holding the transact
//! operations; nothing reaches the server until the command is executed,
//! and the replica itself only changes when the monitor stream reports
//! the committed result back.

use std::collections::BTreeMap;

use ovsdb_link::ops::{Condition, Mutation, Operation};
use ovsdb_link::{Row, Value};
use tracing::warn;
use uuid::Uuid;

use crate::client::Client;
use crate::config::{
    TABLE_ACL, TABLE_ADDRESS_SET, TABLE_LOAD_BALANCER, TABLE_LOGICAL_ROUTER,
    TABLE_LOGICAL_ROUTER_PORT, TABLE_LOGICAL_SWITCH, TABLE_LOGICAL_SWITCH_PORT,
};
use crate::error::Error;
use crate::txn::Command;

#[derive(Clone, Debug, PartialEq)]
pub struct LogicalSwitch {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<Uuid>,
    pub acls: Vec<Uuid>,
    pub load_balancer: Vec<Uuid>,
    pub other_config: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogicalSwitchPort {
    pub uuid: Uuid,
    pub name: String,
    /// Port type; empty for a regular VIF port.
    pub kind: String,
    pub addresses: Vec<String>,
    pub port_security: Vec<String>,
    pub up: Option<bool>,
    pub enabled: Option<bool>,
    pub dynamic_addresses: Option<String>,
    pub dhcpv4_options: Option<Uuid>,
    pub tag: Option<i64>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Acl {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub priority: i64,
    pub direction: String,
    pub match_: String,
    pub action: String,
    pub log: bool,
    pub severity: Option<String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AddressSet {
    pub uuid: Uuid,
    pub name: String,
    pub addresses: Vec<String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadBalancer {
    pub uuid: Uuid,
    pub name: String,
    /// Virtual endpoint to comma-joined backends.
    pub vips: BTreeMap<String, String>,
    pub protocol: Option<String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogicalRouter {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<Uuid>,
    pub static_routes: Vec<Uuid>,
    pub nat: Vec<Uuid>,
    pub load_balancer: Vec<Uuid>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogicalRouterPort {
    pub uuid: Uuid,
    pub name: String,
    pub mac: String,
    pub networks: Vec<String>,
    pub peer: Option<String>,
    pub enabled: Option<bool>,
    pub external_ids: BTreeMap<String, String>,
}

fn required_str(row: &Row, table: &str, column: &str) -> Result<String, Error> {
    row.get(column)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Schema(format!("{table} row lacks a usable {column} column")))
}

fn string_set(row: &Row, column: &str) -> Vec<String> {
    row.get(column).map(Value::string_set).unwrap_or_default()
}

fn uuid_set(row: &Row, column: &str) -> Vec<Uuid> {
    row.get(column).map(Value::uuid_set).unwrap_or_default()
}

fn string_map(row: &Row, column: &str) -> BTreeMap<String, String> {
    row.get(column).map(Value::string_map).unwrap_or_default()
}

impl LogicalSwitch {
    pub(crate) fn from_row(uuid: Uuid, row: &Row) -> Result<LogicalSwitch, Error> {
        Ok(LogicalSwitch {
            uuid,
            name: required_str(row, TABLE_LOGICAL_SWITCH, "name")?,
            ports: uuid_set(row, "ports"),
            acls: uuid_set(row, "acls"),
            load_balancer: uuid_set(row, "load_balancer"),
            other_config: string_map(row, "other_config"),
            external_ids: string_map(row, "external_ids"),
        })
    }
}

impl LogicalSwitchPort {
    pub(crate) fn from_row(uuid: Uuid, row: &Row) -> Result<LogicalSwitchPort, Error> {
        Ok(LogicalSwitchPort {
            uuid,
            name: required_str(row, TABLE_LOGICAL_SWITCH_PORT, "name")?,
            kind: row
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            addresses: string_set(row, "addresses"),
            port_security: string_set(row, "port_security"),
            up: row.get("up").and_then(Value::opt_bool),
            enabled: row.get("enabled").and_then(Value::opt_bool),
            dynamic_addresses: row
                .get("dynamic_addresses")
                .and_then(Value::opt_str)
                .map(str::to_owned),
            dhcpv4_options: row.get("dhcpv4_options").and_then(Value::opt_uuid),
            tag: row.get("tag").and_then(Value::opt_integer),
            options: string_map(row, "options"),
            external_ids: string_map(row, "external_ids"),
        })
    }
}

impl Acl {
    pub(crate) fn from_row(uuid: Uuid, row: &Row) -> Result<Acl, Error> {
        Ok(Acl {
            uuid,
            name: row.get("name").and_then(Value::opt_str).map(str::to_owned),
            priority: row
                .get("priority")
                .and_then(Value::as_integer)
                .ok_or_else(|| Error::Schema("ACL row lacks a priority".into()))?,
            direction: required_str(row, TABLE_ACL, "direction")?,
            match_: required_str(row, TABLE_ACL, "match")?,
            action: required_str(row, TABLE_ACL, "action")?,
            log: row.get("log").and_then(Value::as_bool).unwrap_or(false),
            severity: row
                .get("severity")
                .and_then(Value::opt_str)
                .map(str::to_owned),
            external_ids: string_map(row, "external_ids"),
        })
    }
}

impl AddressSet {
    pub(crate) fn from_row(uuid: Uuid, row: &Row) -> Result<AddressSet, Error> {
        Ok(AddressSet {
            uuid,
            name: required_str(row, TABLE_ADDRESS_SET, "name")?,
            addresses: string_set(row, "addresses"),
            external_ids: string_map(row, "external_ids"),
        })
    }
}

impl LoadBalancer {
    pub(crate) fn from_row(uuid: Uuid, row: &Row) -> Result<LoadBalancer, Error> {
        Ok(LoadBalancer {
            uuid,
            name: required_str(row, TABLE_LOAD_BALANCER, "name")?,
            vips: string_map(row, "vips"),
            protocol: row
                .get("protocol")
                .and_then(Value::opt_str)
                .map(str::to_owned),
            external_ids: string_map(row, "external_ids"),
        })
    }
}

impl LogicalRouter {
    pub(crate) fn from_row(uuid: Uuid, row: &Row) -> Result<LogicalRouter, Error> {
        Ok(LogicalRouter {
            uuid,
            name: required_str(row, TABLE_LOGICAL_ROUTER, "name")?,
            ports: uuid_set(row, "ports"),
            static_routes: uuid_set(row, "static_routes"),
            nat: uuid_set(row, "nat"),
            load_balancer: uuid_set(row, "load_balancer"),
            options: string_map(row, "options"),
            external_ids: string_map(row, "external_ids"),
        })
    }
}

impl LogicalRouterPort {
    pub(crate) fn from_row(uuid: Uuid, row: &Row) -> Result<LogicalRouterPort, Error> {
        Ok(LogicalRouterPort {
            uuid,
            name: required_str(row, TABLE_LOGICAL_ROUTER_PORT, "name")?,
            mac: required_str(row, TABLE_LOGICAL_ROUTER_PORT, "mac")?,
            networks: string_set(row, "networks"),
            peer: row.get("peer").and_then(Value::opt_str).map(str::to_owned),
            enabled: row.get("enabled").and_then(Value::opt_bool),
            external_ids: string_map(row, "external_ids"),
        })
    }
}

fn name_row(name: &str) -> Row {
    let mut row = Row::new();
    row.insert("name".into(), Value::Str(name.into()));
    row
}

fn by_name(name: &str) -> Vec<Condition> {
    vec![Condition::eq("name", Value::Str(name.into()))]
}

fn by_uuid(uuid: Uuid) -> Vec<Condition> {
    vec![Condition::eq("_uuid", Value::Uuid(uuid))]
}

/// Transaction-local name for an inserted row, referenced by the parent
/// mutate in the same batch.
fn fresh_row_name() -> String {
    format!("row{}", Uuid::new_v4().simple())
}

fn map_value(map: &BTreeMap<String, String>) -> Value {
    Value::map_of_strings(map.iter().map(|(k, v)| (k.clone(), v.clone())))
}

impl Client {
    // ---- logical switches ----

    pub async fn ls_add(&self, name: &str) -> Result<Command, Error> {
        if name.is_empty() {
            return Err(Error::InvalidOption("switch name is empty".into()));
        }
        let cache = self.inner.cache.read().await;
        if !cache
            .row_uuids(TABLE_LOGICAL_SWITCH, &name_row(name))
            .is_empty()
        {
            return Err(Error::DuplicateName(name.into()));
        }
        Ok(Command::single(Operation::insert(
            TABLE_LOGICAL_SWITCH,
            name_row(name),
        )))
    }

    pub async fn ls_del(&self, name: &str) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(name.into()))?;
        Ok(Command::single(Operation::delete(
            TABLE_LOGICAL_SWITCH,
            by_name(name),
        )))
    }

    pub async fn ls_get(&self, name: &str) -> Result<LogicalSwitch, Error> {
        let cache = self.inner.cache.read().await;
        let uuid = cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(name.into()))?;
        let row = cache.row(TABLE_LOGICAL_SWITCH, &uuid).ok_or(Error::NotFound)?;
        LogicalSwitch::from_row(uuid, row)
    }

    pub async fn ls_list(&self) -> Vec<LogicalSwitch> {
        let cache = self.inner.cache.read().await;
        let mut switches = decode_all(&cache, TABLE_LOGICAL_SWITCH, LogicalSwitch::from_row);
        switches.sort_by(|a, b| a.name.cmp(&b.name));
        switches
    }

    pub async fn ls_ext_ids_add(
        &self,
        name: &str,
        ids: &BTreeMap<String, String>,
    ) -> Result<Command, Error> {
        self.key_val_set(TABLE_LOGICAL_SWITCH, name, "external_ids", ids)
            .await
    }

    pub async fn ls_ext_ids_del(
        &self,
        name: &str,
        ids: &BTreeMap<String, Option<String>>,
    ) -> Result<Command, Error> {
        self.key_val_del(TABLE_LOGICAL_SWITCH, name, "external_ids", ids)
            .await
    }

    pub async fn ls_lb_add(&self, switch: &str, balancer: &str) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(switch.into()))?;
        let lb = cache.row_uuid(TABLE_LOAD_BALANCER, "name", &Value::Str(balancer.into()))?;
        Ok(Command::single(Operation::mutate(
            TABLE_LOGICAL_SWITCH,
            by_name(switch),
            vec![Mutation::insert("load_balancer", Value::Uuid(lb))],
        )))
    }

    pub async fn ls_lb_del(&self, switch: &str, balancer: &str) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(switch.into()))?;
        let lb = cache.row_uuid(TABLE_LOAD_BALANCER, "name", &Value::Str(balancer.into()))?;
        Ok(Command::single(Operation::mutate(
            TABLE_LOGICAL_SWITCH,
            by_name(switch),
            vec![Mutation::delete("load_balancer", Value::Uuid(lb))],
        )))
    }

    pub async fn ls_lb_list(&self, switch: &str) -> Result<Vec<LoadBalancer>, Error> {
        let cache = self.inner.cache.read().await;
        let ls = cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(switch.into()))?;
        let row = cache.row(TABLE_LOGICAL_SWITCH, &ls).ok_or(Error::NotFound)?;
        let mut balancers =
            decode_referenced(&cache, TABLE_LOAD_BALANCER, &uuid_set(row, "load_balancer"), LoadBalancer::from_row);
        balancers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(balancers)
    }

    // ---- logical switch ports ----

    pub async fn lsp_add(&self, switch: &str, port: &str) -> Result<Command, Error> {
        if port.is_empty() {
            return Err(Error::InvalidOption("port name is empty".into()));
        }
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(switch.into()))?;
        if !cache
            .row_uuids(TABLE_LOGICAL_SWITCH_PORT, &name_row(port))
            .is_empty()
        {
            return Err(Error::DuplicateName(port.into()));
        }
        let row_name = fresh_row_name();
        let insert = Operation::insert(TABLE_LOGICAL_SWITCH_PORT, name_row(port))
            .with_uuid_name(&row_name);
        let attach = Operation::mutate(
            TABLE_LOGICAL_SWITCH,
            by_name(switch),
            vec![Mutation::insert("ports", Value::NamedUuid(row_name))],
        );
        Ok(Command::new(vec![insert, attach]))
    }

    pub async fn lsp_del(&self, port: &str) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        let lsp = cache.row_uuid(TABLE_LOGICAL_SWITCH_PORT, "name", &Value::Str(port.into()))?;
        let parents =
            cache.row_uuids_containing(TABLE_LOGICAL_SWITCH, "ports", &lsp.to_string())?;
        let mut operations = vec![Operation::delete(TABLE_LOGICAL_SWITCH_PORT, by_name(port))];
        for parent in parents {
            operations.push(Operation::mutate(
                TABLE_LOGICAL_SWITCH,
                by_uuid(parent),
                vec![Mutation::delete("ports", Value::Uuid(lsp))],
            ));
        }
        Ok(Command::new(operations))
    }

    pub async fn lsp_get(&self, name: &str) -> Result<LogicalSwitchPort, Error> {
        let cache = self.inner.cache.read().await;
        let uuid = cache.row_uuid(TABLE_LOGICAL_SWITCH_PORT, "name", &Value::Str(name.into()))?;
        let row = cache
            .row(TABLE_LOGICAL_SWITCH_PORT, &uuid)
            .ok_or(Error::NotFound)?;
        LogicalSwitchPort::from_row(uuid, row)
    }

    pub async fn lsp_list(&self, switch: &str) -> Result<Vec<LogicalSwitchPort>, Error> {
        let cache = self.inner.cache.read().await;
        let ls = cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(switch.into()))?;
        let row = cache.row(TABLE_LOGICAL_SWITCH, &ls).ok_or(Error::NotFound)?;
        let mut ports = decode_referenced(
            &cache,
            TABLE_LOGICAL_SWITCH_PORT,
            &uuid_set(row, "ports"),
            LogicalSwitchPort::from_row,
        );
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ports)
    }

    pub async fn lsp_set_addresses(
        &self,
        port: &str,
        addresses: &[String],
    ) -> Result<Command, Error> {
        if addresses.is_empty() {
            return Err(Error::InvalidOption("no addresses given".into()));
        }
        self.lsp_update(port, "addresses", Value::set_of_strings(addresses.iter().cloned()))
            .await
    }

    pub async fn lsp_set_port_security(
        &self,
        port: &str,
        rules: &[String],
    ) -> Result<Command, Error> {
        if rules.is_empty() {
            return Err(Error::InvalidOption("no port security rules given".into()));
        }
        self.lsp_update(
            port,
            "port_security",
            Value::set_of_strings(rules.iter().cloned()),
        )
        .await
    }

    pub async fn lsp_set_type(&self, port: &str, kind: &str) -> Result<Command, Error> {
        self.lsp_update(port, "type", Value::Str(kind.into())).await
    }

    pub async fn lsp_set_options(
        &self,
        port: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Command, Error> {
        self.lsp_update(port, "options", map_value(options)).await
    }

    pub async fn lsp_get_options(&self, port: &str) -> Result<BTreeMap<String, String>, Error> {
        Ok(self.lsp_get(port).await?.options)
    }

    pub async fn lsp_set_dynamic_addresses(
        &self,
        port: &str,
        address: &str,
    ) -> Result<Command, Error> {
        let value = if address.is_empty() {
            Value::Set(Vec::new())
        } else {
            Value::Str(address.into())
        };
        self.lsp_update(port, "dynamic_addresses", value).await
    }

    pub async fn lsp_set_external_ids(
        &self,
        port: &str,
        ids: &BTreeMap<String, String>,
    ) -> Result<Command, Error> {
        self.lsp_update(port, "external_ids", map_value(ids)).await
    }

    pub async fn lsp_get_external_ids(
        &self,
        port: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        Ok(self.lsp_get(port).await?.external_ids)
    }

    /// Full-column update on one switch port addressed by name.
    async fn lsp_update(&self, port: &str, column: &str, value: Value) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_LOGICAL_SWITCH_PORT, "name", &Value::Str(port.into()))?;
        let mut row = Row::new();
        row.insert(column.to_owned(), value);
        Ok(Command::single(Operation::update(
            TABLE_LOGICAL_SWITCH_PORT,
            by_name(port),
            row,
        )))
    }

    // ---- ACLs ----

    #[allow(clippy::too_many_arguments)]
    pub async fn acl_add(
        &self,
        switch: &str,
        direction: &str,
        match_: &str,
        action: &str,
        priority: i64,
        log: bool,
        external_ids: Option<&BTreeMap<String, String>>,
    ) -> Result<Command, Error> {
        if match_.is_empty() {
            return Err(Error::InvalidOption("acl match is empty".into()));
        }
        let cache = self.inner.cache.read().await;
        let ls = cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(switch.into()))?;
        let ls_row = cache.row(TABLE_LOGICAL_SWITCH, &ls).ok_or(Error::NotFound)?;
        if self
            .find_acl(&cache, ls_row, direction, match_, priority, external_ids)
            .is_some()
        {
            return Err(Error::DuplicateName(format!(
                "{direction} {priority} {match_}"
            )));
        }

        let mut row = Row::new();
        row.insert("priority".into(), Value::Integer(priority));
        row.insert("direction".into(), Value::Str(direction.into()));
        row.insert("match".into(), Value::Str(match_.into()));
        row.insert("action".into(), Value::Str(action.into()));
        row.insert("log".into(), Value::Bool(log));
        if let Some(ids) = external_ids {
            row.insert("external_ids".into(), map_value(ids));
        }

        let row_name = fresh_row_name();
        let insert = Operation::insert(TABLE_ACL, row).with_uuid_name(&row_name);
        let attach = Operation::mutate(
            TABLE_LOGICAL_SWITCH,
            by_name(switch),
            vec![Mutation::insert("acls", Value::NamedUuid(row_name))],
        );
        Ok(Command::new(vec![insert, attach]))
    }

    pub async fn acl_del(
        &self,
        switch: &str,
        direction: &str,
        match_: &str,
        priority: i64,
        external_ids: Option<&BTreeMap<String, String>>,
    ) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        let ls = cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(switch.into()))?;
        let ls_row = cache.row(TABLE_LOGICAL_SWITCH, &ls).ok_or(Error::NotFound)?;
        let acl = self
            .find_acl(&cache, ls_row, direction, match_, priority, external_ids)
            .ok_or(Error::NotFound)?;
        Ok(Command::new(vec![
            Operation::mutate(
                TABLE_LOGICAL_SWITCH,
                by_name(switch),
                vec![Mutation::delete("acls", Value::Uuid(acl))],
            ),
            Operation::delete(TABLE_ACL, by_uuid(acl)),
        ]))
    }

    pub async fn acl_list(&self, switch: &str) -> Result<Vec<Acl>, Error> {
        let cache = self.inner.cache.read().await;
        let ls = cache.row_uuid(TABLE_LOGICAL_SWITCH, "name", &Value::Str(switch.into()))?;
        let row = cache.row(TABLE_LOGICAL_SWITCH, &ls).ok_or(Error::NotFound)?;
        let mut acls = decode_referenced(&cache, TABLE_ACL, &uuid_set(row, "acls"), Acl::from_row);
        acls.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.match_.cmp(&b.match_)));
        Ok(acls)
    }

    /// An ACL on `ls_row` matching direction, match expression, priority,
    /// and (when given) the exact external-ids map.
    fn find_acl(
        &self,
        cache: &crate::cache::TableCache,
        ls_row: &Row,
        direction: &str,
        match_: &str,
        priority: i64,
        external_ids: Option<&BTreeMap<String, String>>,
    ) -> Option<Uuid> {
        for uuid in uuid_set(ls_row, "acls") {
            let Some(row) = cache.row(TABLE_ACL, &uuid) else {
                continue;
            };
            let Ok(acl) = Acl::from_row(uuid, row) else {
                continue;
            };
            if acl.direction != direction || acl.match_ != match_ || acl.priority != priority {
                continue;
            }
            if let Some(wanted) = external_ids {
                if !wanted.is_empty() && acl.external_ids != *wanted {
                    continue;
                }
            }
            return Some(uuid);
        }
        None
    }

    // ---- address sets ----

    pub async fn as_add(
        &self,
        name: &str,
        addresses: &[String],
        external_ids: Option<&BTreeMap<String, String>>,
    ) -> Result<Command, Error> {
        if name.is_empty() {
            return Err(Error::InvalidOption("address set name is empty".into()));
        }
        let cache = self.inner.cache.read().await;
        if !cache
            .row_uuids(TABLE_ADDRESS_SET, &name_row(name))
            .is_empty()
        {
            return Err(Error::DuplicateName(name.into()));
        }
        let mut row = name_row(name);
        row.insert(
            "addresses".into(),
            Value::set_of_strings(addresses.iter().cloned()),
        );
        if let Some(ids) = external_ids {
            row.insert("external_ids".into(), map_value(ids));
        }
        Ok(Command::single(Operation::insert(TABLE_ADDRESS_SET, row)))
    }

    pub async fn as_update(
        &self,
        name: &str,
        addresses: &[String],
        external_ids: Option<&BTreeMap<String, String>>,
    ) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_ADDRESS_SET, "name", &Value::Str(name.into()))?;
        let mut row = Row::new();
        row.insert(
            "addresses".into(),
            Value::set_of_strings(addresses.iter().cloned()),
        );
        if let Some(ids) = external_ids {
            row.insert("external_ids".into(), map_value(ids));
        }
        Ok(Command::single(Operation::update(
            TABLE_ADDRESS_SET,
            by_name(name),
            row,
        )))
    }

    pub async fn as_add_ips(&self, name: &str, addresses: &[String]) -> Result<Command, Error> {
        if addresses.is_empty() {
            return Err(Error::InvalidOption("no addresses given".into()));
        }
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_ADDRESS_SET, "name", &Value::Str(name.into()))?;
        Ok(Command::single(Operation::mutate(
            TABLE_ADDRESS_SET,
            by_name(name),
            vec![Mutation::insert(
                "addresses",
                Value::set_of_strings(addresses.iter().cloned()),
            )],
        )))
    }

    pub async fn as_del_ips(&self, name: &str, addresses: &[String]) -> Result<Command, Error> {
        if addresses.is_empty() {
            return Err(Error::InvalidOption("no addresses given".into()));
        }
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_ADDRESS_SET, "name", &Value::Str(name.into()))?;
        Ok(Command::single(Operation::mutate(
            TABLE_ADDRESS_SET,
            by_name(name),
            vec![Mutation::delete(
                "addresses",
                Value::set_of_strings(addresses.iter().cloned()),
            )],
        )))
    }

    pub async fn as_del(&self, name: &str) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_ADDRESS_SET, "name", &Value::Str(name.into()))?;
        Ok(Command::single(Operation::delete(
            TABLE_ADDRESS_SET,
            by_name(name),
        )))
    }

    pub async fn as_get(&self, name: &str) -> Result<AddressSet, Error> {
        let cache = self.inner.cache.read().await;
        let uuid = cache.row_uuid(TABLE_ADDRESS_SET, "name", &Value::Str(name.into()))?;
        let row = cache.row(TABLE_ADDRESS_SET, &uuid).ok_or(Error::NotFound)?;
        AddressSet::from_row(uuid, row)
    }

    pub async fn as_list(&self) -> Vec<AddressSet> {
        let cache = self.inner.cache.read().await;
        let mut sets = decode_all(&cache, TABLE_ADDRESS_SET, AddressSet::from_row);
        sets.sort_by(|a, b| a.name.cmp(&b.name));
        sets
    }

    // ---- logical routers ----

    pub async fn lr_add(
        &self,
        name: &str,
        external_ids: Option<&BTreeMap<String, String>>,
    ) -> Result<Command, Error> {
        if name.is_empty() {
            return Err(Error::InvalidOption("router name is empty".into()));
        }
        let cache = self.inner.cache.read().await;
        if !cache
            .row_uuids(TABLE_LOGICAL_ROUTER, &name_row(name))
            .is_empty()
        {
            return Err(Error::DuplicateName(name.into()));
        }
        let mut row = name_row(name);
        if let Some(ids) = external_ids {
            row.insert("external_ids".into(), map_value(ids));
        }
        Ok(Command::single(Operation::insert(
            TABLE_LOGICAL_ROUTER,
            row,
        )))
    }

    pub async fn lr_del(&self, name: &str) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_LOGICAL_ROUTER, "name", &Value::Str(name.into()))?;
        Ok(Command::single(Operation::delete(
            TABLE_LOGICAL_ROUTER,
            by_name(name),
        )))
    }

    pub async fn lr_get(&self, name: &str) -> Result<LogicalRouter, Error> {
        let cache = self.inner.cache.read().await;
        let uuid = cache.row_uuid(TABLE_LOGICAL_ROUTER, "name", &Value::Str(name.into()))?;
        let row = cache.row(TABLE_LOGICAL_ROUTER, &uuid).ok_or(Error::NotFound)?;
        LogicalRouter::from_row(uuid, row)
    }

    pub async fn lr_list(&self) -> Vec<LogicalRouter> {
        let cache = self.inner.cache.read().await;
        let mut routers = decode_all(&cache, TABLE_LOGICAL_ROUTER, LogicalRouter::from_row);
        routers.sort_by(|a, b| a.name.cmp(&b.name));
        routers
    }

    // ---- logical router ports ----

    pub async fn lrp_add(
        &self,
        router: &str,
        port: &str,
        mac: &str,
        networks: &[String],
        peer: Option<&str>,
        external_ids: Option<&BTreeMap<String, String>>,
    ) -> Result<Command, Error> {
        if mac.is_empty() {
            return Err(Error::InvalidOption("router port mac is empty".into()));
        }
        if networks.is_empty() {
            return Err(Error::InvalidOption("router port needs networks".into()));
        }
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_LOGICAL_ROUTER, "name", &Value::Str(router.into()))?;
        if !cache
            .row_uuids(TABLE_LOGICAL_ROUTER_PORT, &name_row(port))
            .is_empty()
        {
            return Err(Error::DuplicateName(port.into()));
        }

        let mut row = name_row(port);
        row.insert("mac".into(), Value::Str(mac.into()));
        row.insert(
            "networks".into(),
            Value::set_of_strings(networks.iter().cloned()),
        );
        if let Some(peer) = peer {
            row.insert("peer".into(), Value::Str(peer.into()));
        }
        if let Some(ids) = external_ids {
            row.insert("external_ids".into(), map_value(ids));
        }

        let row_name = fresh_row_name();
        let insert = Operation::insert(TABLE_LOGICAL_ROUTER_PORT, row).with_uuid_name(&row_name);
        let attach = Operation::mutate(
            TABLE_LOGICAL_ROUTER,
            by_name(router),
            vec![Mutation::insert("ports", Value::NamedUuid(row_name))],
        );
        Ok(Command::new(vec![insert, attach]))
    }

    pub async fn lrp_del(&self, router: &str, port: &str) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        cache.row_uuid(TABLE_LOGICAL_ROUTER, "name", &Value::Str(router.into()))?;
        let lrp = cache.row_uuid(TABLE_LOGICAL_ROUTER_PORT, "name", &Value::Str(port.into()))?;
        Ok(Command::new(vec![
            Operation::delete(TABLE_LOGICAL_ROUTER_PORT, by_name(port)),
            Operation::mutate(
                TABLE_LOGICAL_ROUTER,
                by_name(router),
                vec![Mutation::delete("ports", Value::Uuid(lrp))],
            ),
        ]))
    }

    pub async fn lrp_list(&self, router: &str) -> Result<Vec<LogicalRouterPort>, Error> {
        let cache = self.inner.cache.read().await;
        let lr = cache.row_uuid(TABLE_LOGICAL_ROUTER, "name", &Value::Str(router.into()))?;
        let row = cache.row(TABLE_LOGICAL_ROUTER, &lr).ok_or(Error::NotFound)?;
        let mut ports = decode_referenced(
            &cache,
            TABLE_LOGICAL_ROUTER_PORT,
            &uuid_set(row, "ports"),
            LogicalRouterPort::from_row,
        );
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ports)
    }

    // ---- load balancers ----

    pub async fn lb_add(
        &self,
        name: &str,
        vip: &str,
        protocol: Option<&str>,
        backends: &[String],
    ) -> Result<Command, Error> {
        if vip.is_empty() || backends.is_empty() {
            return Err(Error::InvalidOption(
                "load balancer needs a vip and backends".into(),
            ));
        }
        let cache = self.inner.cache.read().await;
        if !cache
            .row_uuids(TABLE_LOAD_BALANCER, &name_row(name))
            .is_empty()
        {
            return Err(Error::DuplicateName(name.into()));
        }
        let mut row = name_row(name);
        row.insert(
            "vips".into(),
            Value::map_of_strings([(vip.to_owned(), backends.join(","))]),
        );
        if let Some(protocol) = protocol {
            row.insert("protocol".into(), Value::Str(protocol.into()));
        }
        Ok(Command::single(Operation::insert(TABLE_LOAD_BALANCER, row)))
    }

    pub async fn lb_update(
        &self,
        name: &str,
        vip: &str,
        protocol: Option<&str>,
        backends: &[String],
    ) -> Result<Command, Error> {
        if vip.is_empty() || backends.is_empty() {
            return Err(Error::InvalidOption(
                "load balancer needs a vip and backends".into(),
            ));
        }
        let cache = self.inner.cache.read().await;
        let uuid = cache.row_uuid(TABLE_LOAD_BALANCER, "name", &Value::Str(name.into()))?;
        let cached = cache.row(TABLE_LOAD_BALANCER, &uuid).ok_or(Error::NotFound)?;

        let mut vips = string_map(cached, "vips");
        vips.insert(vip.to_owned(), backends.join(","));
        let mut row = Row::new();
        row.insert("vips".into(), map_value(&vips));
        if let Some(protocol) = protocol {
            row.insert("protocol".into(), Value::Str(protocol.into()));
        }
        Ok(Command::single(Operation::update(
            TABLE_LOAD_BALANCER,
            by_name(name),
            row,
        )))
    }

    pub async fn lb_del(&self, name: &str) -> Result<Command, Error> {
        let cache = self.inner.cache.read().await;
        let lb = cache.row_uuid(TABLE_LOAD_BALANCER, "name", &Value::Str(name.into()))?;
        let mut operations = Vec::new();
        // strong references from switches and routers must go first
        for table in [TABLE_LOGICAL_SWITCH, TABLE_LOGICAL_ROUTER] {
            for parent in cache.row_uuids_containing(table, "load_balancer", &lb.to_string())? {
                operations.push(Operation::mutate(
                    table,
                    by_uuid(parent),
                    vec![Mutation::delete("load_balancer", Value::Uuid(lb))],
                ));
            }
        }
        operations.push(Operation::delete(TABLE_LOAD_BALANCER, by_name(name)));
        Ok(Command::new(operations))
    }

    pub async fn lb_get(&self, name: &str) -> Result<LoadBalancer, Error> {
        let cache = self.inner.cache.read().await;
        let uuid = cache.row_uuid(TABLE_LOAD_BALANCER, "name", &Value::Str(name.into()))?;
        let row = cache.row(TABLE_LOAD_BALANCER, &uuid).ok_or(Error::NotFound)?;
        LoadBalancer::from_row(uuid, row)
    }

    pub async fn lb_list(&self) -> Vec<LoadBalancer> {
        let cache = self.inner.cache.read().await;
        let mut balancers = decode_all(&cache, TABLE_LOAD_BALANCER, LoadBalancer::from_row);
        balancers.sort_by(|a, b| a.name.cmp(&b.name));
        balancers
    }

    // ---- shared key/value plumbing ----

    /// Merge `kv` over the cached map column and write the whole column
    /// back; pairs not mentioned in `kv` survive.
    async fn key_val_set(
        &self,
        table: &str,
        name: &str,
        column: &str,
        kv: &BTreeMap<String, String>,
    ) -> Result<Command, Error> {
        if kv.is_empty() {
            return Err(Error::InvalidOption("no key/value pairs given".into()));
        }
        let cache = self.inner.cache.read().await;
        let uuid = cache.row_uuid(table, "name", &Value::Str(name.into()))?;
        let cached = cache.row(table, &uuid).ok_or(Error::NotFound)?;

        let mut merged = string_map(cached, column);
        for (k, v) in kv {
            merged.insert(k.clone(), v.clone());
        }
        let mut row = Row::new();
        row.insert(column.to_owned(), map_value(&merged));
        Ok(Command::single(Operation::update(table, by_name(name), row)))
    }

    /// Delete map entries. A key with a value deletes only that exact
    /// pair; a key without one deletes the key whatever it holds.
    async fn key_val_del(
        &self,
        table: &str,
        name: &str,
        column: &str,
        kv: &BTreeMap<String, Option<String>>,
    ) -> Result<Command, Error> {
        if kv.is_empty() {
            return Err(Error::InvalidOption("no keys given".into()));
        }
        let cache = self.inner.cache.read().await;
        cache.row_uuid(table, "name", &Value::Str(name.into()))?;

        let mut bare_keys = Vec::new();
        let mut exact_pairs = BTreeMap::new();
        for (k, v) in kv {
            match v {
                Some(v) => {
                    exact_pairs.insert(k.clone(), Value::Str(v.clone()));
                }
                None => bare_keys.push(k.clone()),
            }
        }
        let mut mutations = Vec::new();
        if !bare_keys.is_empty() {
            mutations.push(Mutation::delete(column, Value::set_of_strings(bare_keys)));
        }
        if !exact_pairs.is_empty() {
            mutations.push(Mutation::delete(column, Value::Map(exact_pairs)));
        }
        Ok(Command::single(Operation::mutate(
            table,
            by_name(name),
            mutations,
        )))
    }
}

fn decode_all<T>(
    cache: &crate::cache::TableCache,
    table: &str,
    decode: fn(Uuid, &Row) -> Result<T, Error>,
) -> Vec<T> {
    let mut out = Vec::new();
    for (uuid, row) in cache.rows(table) {
        match decode(*uuid, row) {
            Ok(entity) => out.push(entity),
            Err(err) => warn!(%table, %uuid, error = %err, "skipping undecodable row"),
        }
    }
    out
}

fn decode_referenced<T>(
    cache: &crate::cache::TableCache,
    table: &str,
    uuids: &[Uuid],
    decode: fn(Uuid, &Row) -> Result<T, Error>,
) -> Vec<T> {
    let mut out = Vec::new();
    for uuid in uuids {
        let Some(row) = cache.row(table, uuid) else {
            continue;
        };
        match decode(*uuid, row) {
            Ok(entity) => out.push(entity),
            Err(err) => warn!(%table, %uuid, error = %err, "skipping undecodable row"),
        }
    }
    out
}
