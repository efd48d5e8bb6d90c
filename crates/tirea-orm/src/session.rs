//! Session: one dispatch cycle over a state tree.
//!
//! A session hands out [`BoundModel`]s (a table descriptor paired with the
//! session), collects update records in its [`Transaction`], and folds them
//! into the next state tree in [`Session::get_next_state`].
//!
//! # Example
//!
//! ```
//! use tirea_orm::{Model, Schema, Session};
//! use serde_json::json;
//!
//! let schema = Schema::builder().register(Model::new("Todo")).build().unwrap();
//! let session = Session::new(&schema, schema.empty_state());
//!
//! let todos = session.model("Todo").unwrap();
//! let props = json!({"title": "write docs", "done": false});
//! todos.create(props.as_object().cloned().unwrap()).unwrap();
//!
//! let next = session.get_next_state(Default::default()).unwrap();
//! assert_eq!(next.table("Todo").unwrap().len(), 1);
//! ```

use crate::ops::{self, BatchContext};
use crate::table::record_id;
use crate::{
    Action, Entity, EntityId, Model, OrmError, OrmResult, OrmState, QuerySet, Record, Schema,
    Table, Transaction, UpdateAction, UpdateRecord, ViewMode,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Session behavior fixed at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Apply every update to the live state immediately instead of logging it.
    pub with_mutations: bool,
}

impl SessionConfig {
    /// Set in-place mutation (builder pattern).
    pub fn mutating(mut self, with_mutations: bool) -> Self {
        self.with_mutations = with_mutations;
        self
    }
}

/// Options for one [`Session::get_next_state`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NextStateOptions {
    /// Run table reducers. Defaults to whether the session carries an action.
    pub run_reducers: Option<bool>,
}

impl NextStateOptions {
    /// Force reducers on or off (builder pattern).
    pub fn run_reducers(mut self, run: bool) -> Self {
        self.run_reducers = Some(run);
        self
    }
}

/// One dispatch cycle over a state tree.
pub struct Session<'s> {
    schema: &'s Schema,
    state: RefCell<OrmState>,
    action: Option<Action>,
    config: SessionConfig,
    transaction: RefCell<Transaction>,
    accessed: RefCell<BTreeSet<String>>,
    next_ids: RefCell<HashMap<String, i64>>,
    computing: Cell<bool>,
}

impl<'s> Session<'s> {
    /// Create a session without an action.
    pub fn new(schema: &'s Schema, state: OrmState) -> Self {
        Self::with_config(schema, state, None, SessionConfig::default())
    }

    /// Create a session for a dispatched action.
    pub fn with_action(schema: &'s Schema, state: OrmState, action: Action) -> Self {
        Self::with_config(schema, state, Some(action), SessionConfig::default())
    }

    /// Create a session with explicit configuration.
    pub fn with_config(
        schema: &'s Schema,
        state: OrmState,
        action: Option<Action>,
        config: SessionConfig,
    ) -> Self {
        Self {
            schema,
            state: RefCell::new(state),
            action,
            config,
            transaction: RefCell::new(Transaction::new()),
            accessed: RefCell::new(BTreeSet::new()),
            next_ids: RefCell::new(HashMap::new()),
            computing: Cell::new(false),
        }
    }

    /// The schema this session runs against.
    #[inline]
    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    /// The action, if one was dispatched.
    #[inline]
    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    /// Session configuration.
    #[inline]
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Snapshot of the current state tree.
    pub fn state(&self) -> OrmState {
        self.state.borrow().clone()
    }

    /// Bind a model by table name.
    pub fn model(&self, name: &str) -> OrmResult<BoundModel<'_>> {
        let model = self
            .schema
            .model(name)
            .ok_or_else(|| OrmError::unknown_table(name))?;
        Ok(BoundModel {
            model,
            session: self,
        })
    }

    /// Current value of a table.
    pub fn table(&self, name: &str) -> OrmResult<Arc<Table>> {
        if self.schema.model(name).is_none() {
            return Err(OrmError::unknown_table(name));
        }
        Ok(self.read_table(name))
    }

    fn read_table(&self, name: &str) -> Arc<Table> {
        self.mark_accessed(name);
        self.state.borrow().table(name).cloned().unwrap_or_default()
    }

    /// Record that a table was read during this cycle.
    pub fn mark_accessed(&self, name: &str) {
        let mut accessed = self.accessed.borrow_mut();
        if !accessed.contains(name) {
            accessed.insert(name.to_string());
        }
    }

    /// Tables read during this cycle, in name order.
    pub fn accessed_models(&self) -> Vec<String> {
        self.accessed.borrow().iter().cloned().collect()
    }

    /// Queue an update, or apply it at once when the session mutates in place.
    ///
    /// The record is validated before anything else happens.
    pub fn add_update(&self, record: UpdateRecord) -> OrmResult<()> {
        let model = self
            .schema
            .model(record.table())
            .ok_or_else(|| OrmError::unknown_table(record.table()))?;
        let action = record.action()?;
        if let UpdateAction::Create(created) = &action {
            let id = record_id(created, model.id_attr())
                .ok_or_else(|| OrmError::missing_id(model.name(), model.id_attr()))?;
            self.observe_id(model.name(), &id);
        }

        tracing::trace!(table = record.table(), kind = record.kind.name(), "update recorded");

        if self.config.with_mutations {
            let mut state = self.state.borrow_mut();
            let mut table = state.table(model.name()).cloned().unwrap_or_default();
            ops::apply_update(Arc::make_mut(&mut table), model.name(), &record, model.id_attr())?;
            state.set_table(model.name(), table);
            return Ok(());
        }

        self.transaction.borrow_mut().add_update(record);
        Ok(())
    }

    /// Records logged so far for `table`.
    pub fn updates_for(&self, table: &str) -> Vec<UpdateRecord> {
        self.transaction
            .borrow()
            .updates_for(table)
            .cloned()
            .collect()
    }

    /// Every record logged so far, in recorded order.
    pub fn pending_updates(&self) -> Vec<UpdateRecord> {
        self.transaction.borrow().updates().to_vec()
    }

    /// Number of records logged so far.
    pub fn pending_len(&self) -> usize {
        self.transaction.borrow().len()
    }

    fn observe_id(&self, table: &str, id: &EntityId) {
        if let Some(i) = id.as_i64() {
            let mut next_ids = self.next_ids.borrow_mut();
            let cursor = next_ids.entry(table.to_string()).or_insert(i);
            *cursor = (*cursor).max(i);
        }
    }

    fn allocate_id(&self, table: &str) -> OrmResult<EntityId> {
        let floor = self.read_table(table).meta().max_id.unwrap_or(0);
        let mut next_ids = self.next_ids.borrow_mut();
        let cursor = next_ids.entry(table.to_string()).or_insert(floor);
        let next = (*cursor)
            .max(floor)
            .checked_add(1)
            .ok_or_else(|| OrmError::IdSpaceExhausted {
                table: table.to_string(),
            })?;
        *cursor = next;
        Ok(EntityId::Int(next))
    }

    /// Run reducers (when enabled) and apply the update log, producing the next
    /// state tree.
    ///
    /// The log is closed and replaced by an empty one whether or not the call
    /// succeeds. The session continues from the returned state.
    pub fn get_next_state(&self, options: NextStateOptions) -> OrmResult<OrmState> {
        if self.config.with_mutations {
            return Ok(self.state());
        }
        if self.computing.replace(true) {
            return Err(OrmError::SessionBusy);
        }

        let result = self.compute_next_state(options);

        let mut finished = self.transaction.replace(Transaction::new());
        finished.close();
        self.computing.set(false);

        let next = result?;
        self.next_ids.borrow_mut().clear();
        *self.state.borrow_mut() = next.clone();
        Ok(next)
    }

    /// Equivalent to `get_next_state` with reducers forced on.
    pub fn reduce(&self) -> OrmResult<OrmState> {
        self.get_next_state(NextStateOptions::default().run_reducers(true))
    }

    fn compute_next_state(&self, options: NextStateOptions) -> OrmResult<OrmState> {
        let run_reducers = options.run_reducers.unwrap_or(self.action.is_some());
        let no_action = Action::default();
        let action = self.action.as_ref().unwrap_or(&no_action);

        let mut next = self.state();
        let mut batch = BatchContext::open();
        let mut reducers_run = 0usize;

        for model in self.schema.models() {
            let name = model.name();
            let current = next.table(name).cloned().unwrap_or_default();

            let reduced = match model.table_reducer() {
                Some(reducer) if run_reducers => {
                    reducers_run += 1;
                    reducer
                        .reduce(&current, action, model, self)
                        .inspect_err(|e| tracing::warn!(table = name, error = %e, "reducer failed"))?
                }
                _ => None,
            };

            let updated = match reduced {
                Some(table) => {
                    self.transaction.borrow_mut().mark_applied(name);
                    table
                }
                None => {
                    let pending = self.transaction.borrow_mut().take_pending(name);
                    ops::apply_updates(&mut batch, name, current, &pending, model.id_attr())?
                }
            };
            install(&mut next, name, updated);
        }

        // Records enqueued for a table after its turn came.
        let unapplied: BTreeSet<String> = self
            .transaction
            .borrow()
            .unapplied_updates_by_table()
            .keys()
            .map(|name| name.to_string())
            .collect();
        for model in self.schema.models() {
            let name = model.name();
            if !unapplied.contains(name) {
                continue;
            }
            let pending = self.transaction.borrow_mut().take_pending(name);
            let current = next.take_table(name).unwrap_or_default();
            let updated = ops::apply_updates(&mut batch, name, current, &pending, model.id_attr())?;
            next.set_table(name, updated);
        }

        let summary = batch.close();
        tracing::debug!(
            tables = summary.tables.len(),
            records = summary.records_applied,
            reducers = reducers_run,
            "computed next state"
        );
        Ok(next)
    }
}

fn install(state: &mut OrmState, name: &str, table: Arc<Table>) {
    let unchanged = state
        .table(name)
        .is_some_and(|current| Arc::ptr_eq(current, &table));
    if !unchanged {
        state.set_table(name, table);
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("action", &self.action)
            .field("config", &self.config)
            .field("pending", &self.transaction.borrow().len())
            .field("accessed", &self.accessed.borrow())
            .finish()
    }
}

/// A table descriptor bound to the session that reads and writes it.
#[derive(Clone, Copy)]
pub struct BoundModel<'a> {
    model: &'a Model,
    session: &'a Session<'a>,
}

impl<'a> BoundModel<'a> {
    /// The table descriptor.
    #[inline]
    pub fn model(&self) -> &'a Model {
        self.model
    }

    /// The owning session.
    #[inline]
    pub fn session(&self) -> &'a Session<'a> {
        self.session
    }

    /// Table name.
    #[inline]
    pub fn name(&self) -> &'a str {
        self.model.name()
    }

    /// Field holding an entity's identity value.
    #[inline]
    pub fn id_attribute(&self) -> &'a str {
        self.model.id_attr()
    }

    /// Current table value.
    pub fn table(&self) -> Arc<Table> {
        self.session.read_table(self.name())
    }

    /// Query set over every row, in table order.
    pub fn all(&self) -> QuerySet<'a> {
        let ids = self.table().ids().iter().cloned().collect();
        QuerySet::new(*self, ids, ViewMode::Models)
    }

    /// Number of rows.
    pub fn count(&self) -> usize {
        self.table().len()
    }

    /// Raw record for `id`.
    pub fn access_id(&self, id: impl Into<EntityId>) -> Option<Record> {
        self.table().get(&id.into()).cloned()
    }

    /// Wrapped entity for `id`.
    pub fn with_id(&self, id: impl Into<EntityId>) -> Option<Entity<'a>> {
        let id = id.into();
        let record = self.table().get(&id).cloned()?;
        Some(Entity::new(*self, id, record))
    }

    /// Check whether `id` exists.
    pub fn has_id(&self, id: impl Into<EntityId>) -> bool {
        self.table().contains(&id.into())
    }

    /// Queue a CREATE and return the entity as it will be stored.
    ///
    /// A missing id is allocated from the table's largest integer id. Foreign
    /// keys given as embedded records are reduced to ids; values for
    /// many-to-many fields become link rows.
    pub fn create(&self, props: Record) -> OrmResult<Entity<'a>> {
        let mut record = Record::new();
        let mut links = Vec::new();
        for (field, value) in props {
            match self.model.relation(&field) {
                Some(crate::Relation::ManyToMany { .. }) => links.push((field, value)),
                Some(crate::Relation::ForeignKey { target }) => {
                    let value = self.reduce_reference(target, value);
                    record.insert(field, value);
                }
                None => {
                    record.insert(field, value);
                }
            }
        }

        let id = match record_id(&record, self.id_attribute()) {
            Some(id) => id,
            None => {
                let id = self.session.allocate_id(self.name())?;
                record.insert(self.id_attribute().to_string(), id.to_value());
                id
            }
        };

        self.add_update(UpdateRecord::create(self.name(), record.clone()))?;
        let entity = Entity::new(*self, id, record);

        for (field, value) in links {
            let targets = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            let ids = targets
                .iter()
                .map(|v| {
                    EntityId::from_value(v).ok_or_else(|| {
                        OrmError::malformed_update(
                            "CREATE",
                            self.name(),
                            format!("`{field}` must list related ids"),
                        )
                    })
                })
                .collect::<OrmResult<Vec<_>>>()?;
            entity.add_related(&field, ids)?;
        }
        Ok(entity)
    }

    /// Update the row if its id exists, otherwise create it.
    pub fn upsert(&self, props: Record) -> OrmResult<Entity<'a>> {
        match record_id(&props, self.id_attribute()).and_then(|id| self.with_id(id)) {
            Some(mut entity) => {
                entity.update(props)?;
                Ok(entity)
            }
            None => self.create(props),
        }
    }

    /// Route an update record to the owning session.
    pub fn add_update(&self, record: UpdateRecord) -> OrmResult<()> {
        self.session.add_update(record)
    }

    pub(crate) fn reduce_reference(&self, target: &str, value: Value) -> Value {
        match value {
            Value::Object(embedded) => self
                .session
                .schema()
                .model(target)
                .and_then(|t| embedded.get(t.id_attr()).cloned())
                .unwrap_or(Value::Object(embedded)),
            other => other,
        }
    }
}

impl fmt::Debug for BoundModel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoundModel").field(&self.name()).finish()
    }
}
