//! Update records: queued descriptions of intended table mutations.
//!
//! The wire shape is the interchange contract with inspection tooling:
//!
//! ```text
//! { "type": "UPDATE", "payload": { "ids": [1, 2], "props": { "done": true } }, "meta": { "name": "Todo" } }
//! ```
//!
//! Payloads stay raw JSON on the record so externally produced records survive
//! a round trip untouched; [`UpdateRecord::action`] interprets them.

use crate::{EntityId, OrmError, OrmResult, Record};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind tag of an update record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    /// Insert a record.
    Create,
    /// Shallow-merge props into existing records.
    Update,
    /// Remove records.
    Delete,
}

impl UpdateType {
    /// Get the wire tag.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            UpdateType::Create => "CREATE",
            UpdateType::Update => "UPDATE",
            UpdateType::Delete => "DELETE",
        }
    }
}

/// Routing metadata of an update record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMeta {
    /// Target table name.
    pub name: String,
}

/// A single queued mutation targeting one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Kind tag.
    #[serde(rename = "type")]
    pub kind: UpdateType,
    /// Kind-specific payload.
    pub payload: Value,
    /// Routing metadata.
    pub meta: UpdateMeta,
}

/// Interpreted payload of an [`UpdateRecord`].
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateAction {
    /// Insert (or replace) one record.
    Create(Record),
    /// Merge `props` into every listed id.
    Update {
        /// Targeted ids.
        ids: Vec<EntityId>,
        /// Fields to merge.
        props: Record,
    },
    /// Remove every listed id.
    Delete(Vec<EntityId>),
}

impl UpdateRecord {
    /// Create a CREATE record.
    pub fn create(table: impl Into<String>, record: Record) -> Self {
        Self::raw(UpdateType::Create, table, Value::Object(record))
    }

    /// Create an UPDATE record.
    pub fn update(table: impl Into<String>, ids: Vec<EntityId>, props: Record) -> Self {
        Self::raw(
            UpdateType::Update,
            table,
            json!({ "ids": ids, "props": props }),
        )
    }

    /// Create a DELETE record.
    pub fn delete(table: impl Into<String>, ids: Vec<EntityId>) -> Self {
        Self::raw(UpdateType::Delete, table, json!(ids))
    }

    /// Create a record from its parts without checking the payload.
    pub fn raw(kind: UpdateType, table: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            payload,
            meta: UpdateMeta { name: table.into() },
        }
    }

    /// Parse a record produced by external tooling, checking its payload.
    pub fn from_value(value: Value) -> OrmResult<Self> {
        let record: Self = serde_json::from_value(value)?;
        record.action()?;
        Ok(record)
    }

    /// Target table name.
    #[inline]
    pub fn table(&self) -> &str {
        &self.meta.name
    }

    /// Interpret the payload according to the kind tag.
    pub fn action(&self) -> OrmResult<UpdateAction> {
        let malformed = |message: &str| {
            OrmError::malformed_update(self.kind.name(), self.meta.name.clone(), message)
        };

        match self.kind {
            UpdateType::Create => self
                .payload
                .as_object()
                .cloned()
                .map(UpdateAction::Create)
                .ok_or_else(|| malformed("payload must be an object")),
            UpdateType::Update => {
                let obj = self
                    .payload
                    .as_object()
                    .ok_or_else(|| malformed("payload must be an object"))?;
                let ids = obj
                    .get("ids")
                    .ok_or_else(|| malformed("payload is missing `ids`"))?;
                let ids = parse_ids(ids).ok_or_else(|| malformed("`ids` must be a list of ids"))?;
                let props = obj
                    .get("props")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| malformed("`props` must be an object"))?;
                Ok(UpdateAction::Update { ids, props })
            }
            UpdateType::Delete => parse_ids(&self.payload)
                .map(UpdateAction::Delete)
                .ok_or_else(|| malformed("payload must be a list of ids")),
        }
    }
}

fn parse_ids(value: &Value) -> Option<Vec<EntityId>> {
    value
        .as_array()?
        .iter()
        .map(EntityId::from_value)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_wire_shape() {
        let record =
            UpdateRecord::update("Todo", vec![1.into(), 2.into()], rec(json!({"done": true})));
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "type": "UPDATE",
                "payload": {"ids": [1, 2], "props": {"done": true}},
                "meta": {"name": "Todo"}
            })
        );

        let record = UpdateRecord::delete("Todo", vec!["a".into()]);
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"type": "DELETE", "payload": ["a"], "meta": {"name": "Todo"}})
        );
    }

    #[test]
    fn test_external_record_parses() {
        let record: UpdateRecord = serde_json::from_value(json!({
            "type": "CREATE",
            "payload": {"id": 4, "title": "x"},
            "meta": {"name": "Book"}
        }))
        .unwrap();

        assert_eq!(record.table(), "Book");
        assert_eq!(
            record.action().unwrap(),
            UpdateAction::Create(rec(json!({"id": 4, "title": "x"})))
        );
    }

    #[test]
    fn test_from_value_rejects_bad_input() {
        let err = UpdateRecord::from_value(json!({"type": "MOVE", "payload": [], "meta": {"name": "T"}}))
            .unwrap_err();
        assert!(matches!(err, OrmError::Serialization(_)));

        let err = UpdateRecord::from_value(json!({"type": "DELETE", "payload": 1, "meta": {"name": "T"}}))
            .unwrap_err();
        assert!(matches!(err, OrmError::MalformedUpdate { .. }));
    }

    #[test]
    fn test_action_update() {
        let record = UpdateRecord::update("Todo", vec![3.into()], rec(json!({"a": 1})));
        match record.action().unwrap() {
            UpdateAction::Update { ids, props } => {
                assert_eq!(ids, vec![EntityId::Int(3)]);
                assert_eq!(props["a"], 1);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_payloads() {
        let bad = [
            UpdateRecord::raw(UpdateType::Create, "T", json!([1])),
            UpdateRecord::raw(UpdateType::Update, "T", json!({"ids": [1]})),
            UpdateRecord::raw(UpdateType::Update, "T", json!({"ids": [null], "props": {}})),
            UpdateRecord::raw(UpdateType::Delete, "T", json!({"id": 1})),
        ];
        for record in bad {
            let err = record.action().unwrap_err();
            assert!(
                matches!(err, OrmError::MalformedUpdate { .. }),
                "expected MalformedUpdate, got: {err:?}"
            );
        }
    }
}
