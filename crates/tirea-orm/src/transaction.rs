//! Ordered update log for one dispatch cycle.

use crate::UpdateRecord;
use std::collections::{BTreeMap, HashMap};

/// Append-only log of update records, queryable by target table.
///
/// Besides the records themselves the log remembers, per table, how many of
/// that table's records have been applied. Records appended for a table after
/// it was applied show up again in [`Transaction::unapplied_updates_by_table`].
#[derive(Clone, Debug, Default)]
pub struct Transaction {
    updates: Vec<UpdateRecord>,
    applied: HashMap<String, usize>,
    closed: bool,
}

impl Transaction {
    /// Create an empty log.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn add_update(&mut self, record: UpdateRecord) {
        if self.closed {
            tracing::warn!(table = record.table(), "update recorded on a closed transaction");
        }
        self.updates.push(record);
    }

    /// All records for `table`, in recorded order.
    pub fn updates_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a UpdateRecord> {
        self.updates.iter().filter(move |u| u.table() == table)
    }

    /// Records for `table` that have not been applied yet, in recorded order.
    pub fn pending_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a UpdateRecord> {
        let skip = self.applied.get(table).copied().unwrap_or(0);
        self.updates_for(table).skip(skip)
    }

    /// Mark every record currently logged for `table` as applied.
    pub fn mark_applied(&mut self, table: &str) {
        let count = self.updates_for(table).count();
        self.applied.insert(table.to_string(), count);
    }

    /// Clone out the pending records for `table` and mark them applied.
    pub fn take_pending(&mut self, table: &str) -> Vec<UpdateRecord> {
        let pending: Vec<UpdateRecord> = self.pending_for(table).cloned().collect();
        self.mark_applied(table);
        pending
    }

    /// Pending records grouped by table, restricted to tables that have any.
    pub fn unapplied_updates_by_table(&self) -> BTreeMap<&str, Vec<&UpdateRecord>> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut out: BTreeMap<&str, Vec<&UpdateRecord>> = BTreeMap::new();
        for update in &self.updates {
            let table = update.table();
            let position = seen.entry(table).or_insert(0);
            let applied = self.applied.get(table).copied().unwrap_or(0);
            if *position >= applied {
                out.entry(table).or_default().push(update);
            }
            *position += 1;
        }
        out
    }

    /// Mark the log finished for this cycle.
    #[inline]
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Check whether the log was closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Total number of records.
    #[inline]
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Check if nothing was recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// All records in recorded order.
    #[inline]
    pub fn updates(&self) -> &[UpdateRecord] {
        &self.updates
    }
}
