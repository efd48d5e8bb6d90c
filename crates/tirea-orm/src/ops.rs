//! Copy-on-write application of update records to tables.
//!
//! Application is bracketed by a [`BatchContext`] that lives for one
//! `get_next_state` call. The first apply for a table inside a batch copies the
//! table (cheaply, the underlying collections are persistent); later applies
//! for the same table mutate the copy the batch already owns.

use crate::table::record_id;
use crate::{EntityId, OrmError, OrmResult, Table, UpdateAction, UpdateRecord};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Bracketing state for one batch of table applications.
#[derive(Debug, Default)]
pub struct BatchContext {
    owned: BTreeSet<String>,
    records_applied: usize,
}

/// What a closed batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Tables that received a new value, in name order.
    pub tables: Vec<String>,
    /// Number of update records applied.
    pub records_applied: usize,
}

impl BatchContext {
    /// Open a new batch.
    #[inline]
    pub fn open() -> Self {
        Self::default()
    }

    /// Check whether this batch already produced a value for `table`.
    #[inline]
    pub fn owns(&self, table: &str) -> bool {
        self.owned.contains(table)
    }

    /// Close the batch.
    pub fn close(self) -> BatchSummary {
        BatchSummary {
            tables: self.owned.into_iter().collect(),
            records_applied: self.records_applied,
        }
    }
}

/// Apply `updates` to `table` in recorded order.
///
/// The input value is never mutated unless this batch produced it. An empty
/// update list hands back the very same `Arc`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tirea_orm::{ops, Table, UpdateRecord};
/// use serde_json::json;
///
/// let record = json!({"id": 1, "title": "Dune"}).as_object().cloned().unwrap();
/// let table = Arc::new(Table::from_records("Book", "id", vec![record]).unwrap());
///
/// let mut batch = ops::BatchContext::open();
/// let same = ops::apply_updates(&mut batch, "Book", Arc::clone(&table), &[], "id").unwrap();
/// assert!(Arc::ptr_eq(&same, &table));
///
/// let delete = UpdateRecord::delete("Book", vec![1.into()]);
/// let next = ops::apply_updates(&mut batch, "Book", Arc::clone(&table), &[delete], "id").unwrap();
/// assert!(next.is_empty());
/// assert_eq!(table.len(), 1);
/// ```
pub fn apply_updates(
    ctx: &mut BatchContext,
    table_name: &str,
    table: Arc<Table>,
    updates: &[UpdateRecord],
    id_attribute: &str,
) -> OrmResult<Arc<Table>> {
    if updates.is_empty() {
        return Ok(table);
    }

    let mut next = if ctx.owns(table_name) {
        table
    } else {
        Arc::new(Table::clone(&table))
    };

    let draft = Arc::make_mut(&mut next);
    for update in updates {
        apply_update(draft, table_name, update, id_attribute)?;
    }

    tracing::trace!(table = table_name, records = updates.len(), "applied updates");
    ctx.owned.insert(table_name.to_string());
    ctx.records_applied += updates.len();
    Ok(next)
}

/// Apply a single record to a table (mutating).
pub(crate) fn apply_update(
    table: &mut Table,
    table_name: &str,
    update: &UpdateRecord,
    id_attribute: &str,
) -> OrmResult<()> {
    if update.table() != table_name {
        return Err(OrmError::malformed_update(
            update.kind.name(),
            table_name,
            format!("record targets table {}", update.table()),
        ));
    }

    match update.action()? {
        UpdateAction::Create(record) => {
            let id = record_id(&record, id_attribute)
                .ok_or_else(|| OrmError::missing_id(table_name, id_attribute))?;
            table.insert(id, record);
        }
        UpdateAction::Update { ids, props } => {
            for id in &ids {
                table.merge(id, &props);
            }
        }
        UpdateAction::Delete(ids) => {
            let ids: HashSet<EntityId> = ids.into_iter().collect();
            table.remove_all(&ids);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;
    use serde_json::{json, Value};

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn books() -> Arc<Table> {
        Arc::new(
            Table::from_records(
                "Book",
                "id",
                vec![
                    rec(json!({"id": 1, "title": "A", "rating": 3})),
                    rec(json!({"id": 2, "title": "B", "rating": 5})),
                    rec(json!({"id": 3, "title": "C", "rating": 4})),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_empty_updates_return_same_table() {
        let table = books();
        let mut ctx = BatchContext::open();
        let next = apply_updates(&mut ctx, "Book", Arc::clone(&table), &[], "id").unwrap();
        assert!(Arc::ptr_eq(&table, &next));
        assert_eq!(ctx.close(), BatchSummary::default());
    }

    #[test]
    fn test_update_merges_last_write_wins() {
        let table = books();
        let updates = vec![
            UpdateRecord::update("Book", vec![1.into()], rec(json!({"title": "X", "rating": 1}))),
            UpdateRecord::update("Book", vec![1.into()], rec(json!({"title": "Y"}))),
        ];
        let mut ctx = BatchContext::open();
        let next = apply_updates(&mut ctx, "Book", Arc::clone(&table), &updates, "id").unwrap();

        let row = next.get(&1.into()).unwrap();
        assert_eq!(row["title"], "Y");
        assert_eq!(row["rating"], 1);
        // input untouched
        assert_eq!(table.get(&1.into()).unwrap()["title"], "A");
        assert!(!Arc::ptr_eq(&table, &next));
    }

    #[test]
    fn test_update_ignores_missing_ids() {
        let table = books();
        let updates = vec![UpdateRecord::update("Book", vec![9.into()], rec(json!({"x": 1})))];
        let mut ctx = BatchContext::open();
        let next = apply_updates(&mut ctx, "Book", table, &updates, "id").unwrap();
        assert_eq!(next.len(), 3);
        assert!(!next.contains(&9.into()));
    }

    #[test]
    fn test_delete_removes_from_both_views() {
        let table = books();
        let updates = vec![UpdateRecord::delete("Book", vec![2.into()])];
        let mut ctx = BatchContext::open();
        let next = apply_updates(&mut ctx, "Book", Arc::clone(&table), &updates, "id").unwrap();

        assert_eq!(next.len(), table.len() - 1);
        assert!(next.get(&2.into()).is_none());
        assert!(!next.ids().iter().any(|id| id == &EntityId::Int(2)));
    }

    #[test]
    fn test_create_appends_and_tracks_max_id() {
        let table = books();
        let updates = vec![UpdateRecord::create("Book", rec(json!({"id": 10, "title": "Z"})))];
        let mut ctx = BatchContext::open();
        let next = apply_updates(&mut ctx, "Book", table, &updates, "id").unwrap();

        assert_eq!(next.ids().last(), Some(&EntityId::Int(10)));
        assert_eq!(next.meta().max_id, Some(10));
    }

    #[test]
    fn test_second_apply_in_batch_reuses_owned_copy() {
        let table = books();
        let mut ctx = BatchContext::open();
        let first = apply_updates(
            &mut ctx,
            "Book",
            Arc::clone(&table),
            &[UpdateRecord::delete("Book", vec![1.into()])],
            "id",
        )
        .unwrap();
        assert!(ctx.owns("Book"));

        let first_ptr = Arc::as_ptr(&first);
        let second = apply_updates(
            &mut ctx,
            "Book",
            first,
            &[UpdateRecord::delete("Book", vec![2.into()])],
            "id",
        )
        .unwrap();

        assert_eq!(Arc::as_ptr(&second), first_ptr);
        assert_eq!(second.len(), 1);
        let summary = ctx.close();
        assert_eq!(summary.tables, vec!["Book".to_string()]);
        assert_eq!(summary.records_applied, 2);
    }

    #[test]
    fn test_wrong_table_is_malformed() {
        let mut ctx = BatchContext::open();
        let err = apply_updates(
            &mut ctx,
            "Book",
            books(),
            &[UpdateRecord::delete("Author", vec![1.into()])],
            "id",
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::MalformedUpdate { .. }));
    }

    #[test]
    fn test_create_without_id_fails() {
        let mut ctx = BatchContext::open();
        let err = apply_updates(
            &mut ctx,
            "Book",
            books(),
            &[UpdateRecord::create("Book", rec(json!({"title": "no id"})))],
            "id",
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::MissingId { .. }));
    }
}
