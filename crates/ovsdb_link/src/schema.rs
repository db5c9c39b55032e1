//! Database schema model.
//!
//! Parses the `get_schema` reply far enough to answer the questions the
//! replica layer asks: which tables and columns exist, whether a column is
//! a map or a set, its cardinality bounds, and what value to synthesize
//! when the server omits the column entirely.

use std::collections::BTreeMap;

use serde::{de, Deserialize};

use crate::value::Value;

/// Schema for one database.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSchema>,
}

impl DatabaseSchema {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnSchema> {
        self.tables.get(table).and_then(|t| t.columns.get(column))
    }
}

/// Schema for one table.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSchema>,
    #[serde(default, rename = "isRoot")]
    pub is_root: bool,
}

/// Atomic column types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomType {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
}

/// Constraints on one side of a column type.
#[derive(Clone, Debug, PartialEq)]
pub struct AtomSchema {
    pub atom: AtomType,
    pub min_integer: Option<i64>,
    pub max_integer: Option<i64>,
    pub min_real: Option<f64>,
    pub max_real: Option<f64>,
    pub ref_table: Option<String>,
}

impl AtomSchema {
    fn bare(atom: AtomType) -> AtomSchema {
        AtomSchema {
            atom,
            min_integer: None,
            max_integer: None,
            min_real: None,
            max_real: None,
            ref_table: None,
        }
    }
}

/// Upper cardinality bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardMax {
    Bounded(u64),
    Unlimited,
}

impl<'de> Deserialize<'de> for CardMax {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Word(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(CardMax::Bounded(n)),
            Raw::Word(w) if w == "unlimited" => Ok(CardMax::Unlimited),
            Raw::Word(w) => Err(de::Error::custom(format!("bad cardinality {w:?}"))),
        }
    }
}

/// Schema for one column, with type and cardinality flattened out of the
/// wire representation's nesting.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSchema {
    pub key: AtomSchema,
    pub value: Option<AtomSchema>,
    pub min: u64,
    pub max: CardMax,
}

impl ColumnSchema {
    pub fn is_map(&self) -> bool {
        self.value.is_some()
    }

    pub fn max_one(&self) -> bool {
        self.max == CardMax::Bounded(1)
    }

    pub fn is_set(&self) -> bool {
        !self.is_map() && (self.min != 1 || !self.max_one())
    }

    /// Value a row carries for this column when the server sends nothing.
    pub fn default_value(&self) -> Value {
        if self.is_map() {
            return Value::Map(BTreeMap::new());
        }
        if !self.max_one() {
            return Value::Set(Vec::new());
        }
        match self.key.atom {
            AtomType::Integer => Value::Integer(self.key.min_integer.unwrap_or(0)),
            AtomType::Real => Value::Real(self.key.min_real.unwrap_or(0.0)),
            AtomType::Boolean => {
                if self.min == 0 {
                    Value::Null
                } else {
                    Value::Bool(false)
                }
            }
            AtomType::String => Value::Str(String::new()),
            AtomType::Uuid => Value::Null,
        }
    }
}

// A column's "type" is either a bare atomic-type name or an object with
// key/value/min/max members; each base type is likewise a name or an
// object carrying range constraints.

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBase {
    Name(AtomType),
    Object {
        #[serde(rename = "type")]
        atom: AtomType,
        #[serde(rename = "minInteger")]
        min_integer: Option<i64>,
        #[serde(rename = "maxInteger")]
        max_integer: Option<i64>,
        #[serde(rename = "minReal")]
        min_real: Option<f64>,
        #[serde(rename = "maxReal")]
        max_real: Option<f64>,
        #[serde(rename = "refTable")]
        ref_table: Option<String>,
    },
}

impl From<RawBase> for AtomSchema {
    fn from(raw: RawBase) -> AtomSchema {
        match raw {
            RawBase::Name(atom) => AtomSchema::bare(atom),
            RawBase::Object {
                atom,
                min_integer,
                max_integer,
                min_real,
                max_real,
                ref_table,
            } => AtomSchema {
                atom,
                min_integer,
                max_integer,
                min_real,
                max_real,
                ref_table,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawType {
    Atom(RawBase),
    Full {
        key: RawBase,
        value: Option<RawBase>,
        min: Option<u64>,
        max: Option<CardMax>,
    },
}

impl<'de> Deserialize<'de> for ColumnSchema {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct RawColumn {
            #[serde(rename = "type")]
            kind: RawType,
        }
        let column = match RawColumn::deserialize(deserializer)?.kind {
            RawType::Atom(base) => ColumnSchema {
                key: base.into(),
                value: None,
                min: 1,
                max: CardMax::Bounded(1),
            },
            RawType::Full {
                key,
                value,
                min,
                max,
            } => ColumnSchema {
                key: key.into(),
                value: value.map(AtomSchema::from),
                min: min.unwrap_or(1),
                max: max.unwrap_or(CardMax::Bounded(1)),
            },
        };
        Ok(column)
    }
}
