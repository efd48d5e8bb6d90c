//! Normalized table values and the state tree that owns them.
//!
//! A [`Table`] is an ordered id sequence plus an id → record mapping. Both are
//! persistent structures, so cloning a table shares everything that is not
//! subsequently touched.

use crate::{OrmError, OrmResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A raw entity record: a plain field mapping.
pub type Record = Map<String, Value>;

/// Identity value of an entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Integer id.
    Int(i64),
    /// String id.
    Str(String),
}

impl EntityId {
    /// Read an id from a JSON value. Only integers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(EntityId::Int),
            Value::String(s) => Some(EntityId::Str(s.clone())),
            _ => None,
        }
    }

    /// Convert to a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Int(i) => Value::from(*i),
            EntityId::Str(s) => Value::from(s.as_str()),
        }
    }

    /// The integer form, if this is an integer id.
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EntityId::Int(i) => Some(*i),
            EntityId::Str(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(i) => write!(f, "{i}"),
            EntityId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId::Int(v)
    }
}

impl From<i32> for EntityId {
    fn from(v: i32) -> Self {
        EntityId::Int(v as i64)
    }
}

impl From<u32> for EntityId {
    fn from(v: u32) -> Self {
        EntityId::Int(v as i64)
    }
}

impl From<&str> for EntityId {
    fn from(v: &str) -> Self {
        EntityId::Str(v.to_string())
    }
}

impl From<String> for EntityId {
    fn from(v: String) -> Self {
        EntityId::Str(v)
    }
}

/// Read the id of a record under the given id attribute.
pub fn record_id(record: &Record, id_attribute: &str) -> Option<EntityId> {
    record.get(id_attribute).and_then(EntityId::from_value)
}

/// Bookkeeping stored alongside a table's rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableMeta {
    /// Largest integer id ever inserted into the table.
    pub max_id: Option<i64>,
}

impl TableMeta {
    pub(crate) fn observe(&mut self, id: &EntityId) {
        if let Some(i) = id.as_i64() {
            self.max_id = Some(self.max_id.map_or(i, |m| m.max(i)));
        }
    }
}

/// One entity table: ordered ids plus an id → record mapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    items: im::Vector<EntityId>,
    items_by_id: im::HashMap<EntityId, Record>,
    meta: TableMeta,
}

impl Table {
    /// Create an empty table.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from records, in iteration order.
    ///
    /// Every record must carry an integer or string value under `id_attribute`.
    pub fn from_records(
        table_name: &str,
        id_attribute: &str,
        records: impl IntoIterator<Item = Record>,
    ) -> OrmResult<Self> {
        let mut table = Table::new();
        for record in records {
            let id = record_id(&record, id_attribute)
                .ok_or_else(|| OrmError::missing_id(table_name, id_attribute))?;
            table.insert(id, record);
        }
        Ok(table)
    }

    /// Ids in table order.
    #[inline]
    pub fn ids(&self) -> &im::Vector<EntityId> {
        &self.items
    }

    /// Look up a record by id.
    #[inline]
    pub fn get(&self, id: &EntityId) -> Option<&Record> {
        self.items_by_id.get(id)
    }

    /// Check whether the table holds an id.
    #[inline]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.items_by_id.contains_key(id)
    }

    /// Number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the table has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Table bookkeeping.
    #[inline]
    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    /// Iterate rows in table order.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &Record)> {
        self.items
            .iter()
            .filter_map(move |id| self.items_by_id.get(id).map(|record| (id, record)))
    }

    /// Insert or replace a record. New ids are appended to the sequence.
    pub(crate) fn insert(&mut self, id: EntityId, record: Record) {
        self.meta.observe(&id);
        if self.items_by_id.insert(id.clone(), record).is_none() {
            self.items.push_back(id);
        }
    }

    /// Shallow-merge `props` into the record for `id`. Returns false if absent.
    pub(crate) fn merge(&mut self, id: &EntityId, props: &Record) -> bool {
        match self.items_by_id.get_mut(id) {
            Some(record) => {
                for (k, v) in props {
                    record.insert(k.clone(), v.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Remove every id in `ids`. Returns the number of rows removed.
    pub(crate) fn remove_all(&mut self, ids: &HashSet<EntityId>) -> usize {
        let before = self.items.len();
        for id in ids {
            self.items_by_id.remove(id);
        }
        self.items.retain(|id| !ids.contains(id));
        before - self.items.len()
    }
}

/// The state tree: table name → table value.
///
/// Tables are held behind `Arc` so an untouched table stays pointer-identical
/// across dispatch cycles.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrmState {
    tables: im::OrdMap<String, Arc<Table>>,
}

impl OrmState {
    /// Create an empty state tree.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a table by name.
    #[inline]
    pub fn table(&self, name: &str) -> Option<&Arc<Table>> {
        self.tables.get(name)
    }

    /// Replace a table (builder pattern).
    pub fn with_table(mut self, name: impl Into<String>, table: impl Into<Arc<Table>>) -> Self {
        self.set_table(name, table);
        self
    }

    /// Replace a table in place.
    pub fn set_table(&mut self, name: impl Into<String>, table: impl Into<Arc<Table>>) {
        self.tables.insert(name.into(), table.into());
    }

    /// Detach a table from the tree, leaving the caller as its only holder
    /// when nothing else shares it.
    pub(crate) fn take_table(&mut self, name: &str) -> Option<Arc<Table>> {
        self.tables.remove(name)
    }

    /// Table names in lexical order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Check whether `other` holds the very same table value for `name`.
    pub fn shares_table(&self, other: &OrmState, name: &str) -> bool {
        match (self.table(name), other.table(name)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
