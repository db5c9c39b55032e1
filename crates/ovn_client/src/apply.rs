//! Applies monitor payloads to the replica.
//!
//! Two entry points mirror the two notification shapes: full-row snapshot
//! updates, and delta updates whose `modify` rows carry diffs that merge
//! into the cached row (per-key toggles for maps, membership toggles for
//! wide sets, plain replacement otherwise). Both defer row removal to the
//! end of the batch and report events for a dispatcher to run after the
//! cache lock is released.

use std::collections::BTreeMap;

use ovsdb_link::ops::{TableUpdates, TableUpdates2};
use ovsdb_link::schema::{DatabaseSchema, TableSchema};
use ovsdb_link::value::{collapse_set, normalize_integral_reals, toggle_set_element};
use ovsdb_link::{Row, Value};
use tracing::warn;
use uuid::Uuid;

use crate::cache::TableCache;

/// A cache change worth telling the signal handler about, resolved while
/// the cache lock was still held.
#[derive(Clone, Debug)]
pub(crate) enum CacheEvent {
    Created { table: String, uuid: Uuid, row: Row },
    Deleted { table: String, uuid: Uuid, row: Row },
}

/// Apply a classic monitor payload of full old/new rows.
///
/// A present, non-empty `new` row upserts; re-delivering the exact cached
/// content is a no-op. An empty or absent `new` row deletes, with the
/// removal held back until the whole batch is in so late creates in the
/// same payload never resurrect under a stale row id.
pub(crate) fn apply_snapshot(
    cache: &mut TableCache,
    tables: &BTreeMap<String, Vec<String>>,
    updates: TableUpdates,
    signal: bool,
) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    let mut doomed: Vec<(String, Uuid)> = Vec::new();
    let mut updates = updates;

    for table in tables.keys() {
        cache.ensure_table(table);
        let Some(rows) = updates.remove(table) else {
            continue;
        };
        for (uuid, update) in rows {
            match update.new {
                Some(mut new) if !new.is_empty() => {
                    normalize_integral_reals(&mut new);
                    if cache.row(table, &uuid) == Some(&new) {
                        continue;
                    }
                    if signal {
                        events.push(CacheEvent::Created {
                            table: table.clone(),
                            uuid,
                            row: new.clone(),
                        });
                    }
                    cache.insert(table, uuid, new);
                }
                _ => doomed.push((table.clone(), uuid)),
            }
        }
    }

    for (table, uuid) in doomed {
        if let Some(row) = cache.row(&table, &uuid).cloned() {
            if signal {
                events.push(CacheEvent::Deleted {
                    table: table.clone(),
                    uuid,
                    row,
                });
            }
            cache.remove(&table, &uuid);
        }
    }

    events
}

/// Apply a delta monitor payload.
pub(crate) fn apply_delta(
    cache: &mut TableCache,
    schema: &DatabaseSchema,
    tables: &BTreeMap<String, Vec<String>>,
    updates: TableUpdates2,
    signal: bool,
) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    let mut doomed: Vec<(String, Uuid)> = Vec::new();
    let mut updates = updates;

    for table in tables.keys() {
        cache.ensure_table(table);
        let Some(rows) = updates.remove(table) else {
            continue;
        };
        for (uuid, update) in rows {
            if let Some(mut initial) = update.initial {
                normalize_integral_reals(&mut initial);
                // compared before default synthesis, so a resumed dump of
                // an already-cached row stays a no-op
                if cache.row(table, &uuid) == Some(&initial) {
                    continue;
                }
                if let Some(table_schema) = schema.table(table) {
                    fill_defaults(&mut initial, table_schema);
                }
                if signal {
                    events.push(CacheEvent::Created {
                        table: table.clone(),
                        uuid,
                        row: initial.clone(),
                    });
                }
                cache.insert(table, uuid, initial);
            } else if let Some(mut insert) = update.insert {
                if let Some(table_schema) = schema.table(table) {
                    fill_defaults(&mut insert, table_schema);
                }
                normalize_integral_reals(&mut insert);
                if signal {
                    events.push(CacheEvent::Created {
                        table: table.clone(),
                        uuid,
                        row: insert.clone(),
                    });
                }
                cache.insert(table, uuid, insert);
            } else if let Some(mut modify) = update.modify {
                normalize_integral_reals(&mut modify);
                let Some(cached) = cache.row(table, &uuid).cloned() else {
                    warn!(%table, %uuid, "modify for a row we never saw, skipping");
                    continue;
                };
                let mut merged = cached;
                merge_diff(&mut merged, schema, table, modify);
                if signal {
                    events.push(CacheEvent::Created {
                        table: table.clone(),
                        uuid,
                        row: merged.clone(),
                    });
                }
                cache.insert(table, uuid, merged);
            } else if update.delete.is_some() {
                if let Some(row) = cache.row(table, &uuid).cloned() {
                    if signal {
                        events.push(CacheEvent::Deleted {
                            table: table.clone(),
                            uuid,
                            row,
                        });
                    }
                    doomed.push((table.clone(), uuid));
                }
            }
        }
    }

    for (table, uuid) in doomed {
        cache.remove(&table, &uuid);
    }

    events
}

/// Merge one `modify` diff into a cached row.
///
/// Map columns toggle per key: an unknown key is inserted, a key carrying
/// a different value is overwritten, and a key carrying the cached value
/// is removed. Set columns with room for more than one element toggle
/// membership per element, then collapse back to a bare scalar when
/// exactly one remains. Everything else is the new value outright.
fn merge_diff(cached: &mut Row, schema: &DatabaseSchema, table: &str, diff: Row) {
    for (column, incoming) in diff {
        match schema.column(table, &column) {
            Some(col) if col.is_map() => {
                let mut map = match cached.get(&column) {
                    Some(Value::Map(m)) => m.clone(),
                    _ => BTreeMap::new(),
                };
                let Value::Map(delta) = incoming else {
                    warn!(%table, %column, "map diff with a non-map value, skipping");
                    continue;
                };
                for (key, value) in delta {
                    match map.get(&key) {
                        Some(old) if *old == value => {
                            map.remove(&key);
                        }
                        _ => {
                            map.insert(key, value);
                        }
                    }
                }
                cached.insert(column, Value::Map(map));
            }
            Some(col) if col.is_set() && !col.max_one() => {
                let mut items = match cached.remove(&column) {
                    Some(Value::Set(items)) => items,
                    Some(bare) => vec![bare],
                    None => Vec::new(),
                };
                let delta = match incoming {
                    Value::Set(items) => items,
                    bare => vec![bare],
                };
                for element in &delta {
                    toggle_set_element(&mut items, element);
                }
                cached.insert(column, collapse_set(items));
            }
            _ => {
                cached.insert(column, incoming);
            }
        }
    }
}

fn fill_defaults(row: &mut Row, table_schema: &TableSchema) {
    for (name, column) in &table_schema.columns {
        if !row.contains_key(name) {
            row.insert(name.clone(), column.default_value());
        }
    }
}
