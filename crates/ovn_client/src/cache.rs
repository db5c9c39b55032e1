//! In-memory table replica.
//!
//! Rows live exactly as the monitor stream delivered them (after numeric
//! normalization and default synthesis). Lookups never touch the network;
//! a row that is not here does not exist as far as this client knows.

use std::collections::HashMap;

use ovsdb_link::{Row, Value};
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Default)]
pub(crate) struct TableCache {
    tables: HashMap<String, HashMap<Uuid, Row>>,
}

impl TableCache {
    pub fn new() -> TableCache {
        TableCache::default()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn ensure_table(&mut self, table: &str) {
        if !self.tables.contains_key(table) {
            self.tables.insert(table.to_owned(), HashMap::new());
        }
    }

    pub fn row(&self, table: &str, uuid: &Uuid) -> Option<&Row> {
        self.tables.get(table).and_then(|rows| rows.get(uuid))
    }

    pub fn rows(&self, table: &str) -> impl Iterator<Item = (&Uuid, &Row)> {
        self.tables.get(table).into_iter().flatten()
    }

    pub fn insert(&mut self, table: &str, uuid: Uuid, row: Row) {
        self.tables.entry(table.to_owned()).or_default().insert(uuid, row);
    }

    pub fn remove(&mut self, table: &str, uuid: &Uuid) -> Option<Row> {
        self.tables.get_mut(table).and_then(|rows| rows.remove(uuid))
    }

    /// Rows matching a field-equality predicate. An empty predicate is a
    /// wildcard. A predicate field absent from a row does not disqualify
    /// the row; at least one field must be present and equal for a match.
    pub fn row_uuids(&self, table: &str, predicate: &Row) -> Vec<Uuid> {
        let Some(rows) = self.tables.get(table) else {
            return Vec::new();
        };
        let mut uuids = Vec::new();
        for (uuid, cached) in rows {
            if predicate.is_empty() {
                uuids.push(*uuid);
                continue;
            }
            let mut hit = false;
            for (field, wanted) in predicate {
                match cached.get(field) {
                    None => continue,
                    Some(have) if have == wanted => hit = true,
                    Some(_) => {
                        hit = false;
                        break;
                    }
                }
            }
            if hit {
                uuids.push(*uuid);
            }
        }
        uuids
    }

    /// The single row where `field == value`.
    pub fn row_uuid(&self, table: &str, field: &str, value: &Value) -> Result<Uuid, Error> {
        let mut predicate = Row::new();
        predicate.insert(field.to_owned(), value.clone());
        let matches = self.row_uuids(table, &predicate);
        match matches.as_slice() {
            [] => Err(Error::NotFound),
            [only] => Ok(*only),
            _ => Err(Error::DuplicateName(value.to_string())),
        }
    }

    /// Rows whose formatted `field` value contains `needle`, typically a
    /// row id searched for inside a reference set.
    pub fn row_uuids_containing(
        &self,
        table: &str,
        field: &str,
        needle: &str,
    ) -> Result<Vec<Uuid>, Error> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| Error::Schema(format!("table {table} is not replicated")))?;
        let mut uuids = Vec::new();
        for (uuid, cached) in rows {
            if let Some(value) = cached.get(field) {
                if value.to_string().contains(needle) {
                    uuids.push(*uuid);
                }
            }
        }
        Ok(uuids)
    }
}
