//! Chainable, immutable query sets over one table's ids.
//!
//! A [`QuerySet`] holds an ordered id list and a view mode. Transforming
//! operations return new query sets; `update` and `delete` only append records
//! to the session's update log.

use crate::schema::Relation;
use crate::{BoundModel, Entity, EntityId, OrmError, OrmResult, Record, Table, UpdateRecord};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// How a query set materializes its elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// Wrapped entities.
    #[default]
    Models,
    /// Raw records.
    Refs,
}

/// One materialized element of a query set.
#[derive(Clone, Debug)]
pub enum Item<'a> {
    /// Raw record.
    Ref(Record),
    /// Wrapped entity.
    Model(Entity<'a>),
}

impl<'a> Item<'a> {
    /// The raw record behind the element.
    pub fn record(&self) -> &Record {
        match self {
            Item::Ref(record) => record,
            Item::Model(entity) => entity.record(),
        }
    }

    /// Read one field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.record().get(field)
    }

    /// The wrapped entity, if this element is one.
    pub fn as_entity(&self) -> Option<&Entity<'a>> {
        match self {
            Item::Model(entity) => Some(entity),
            Item::Ref(_) => None,
        }
    }
}

/// Exact-equality field matcher.
///
/// Values given for foreign-key fields may be wrapped entities or embedded
/// records of the target; they are reduced to the target id before comparing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldMatch {
    fields: Vec<(String, Value)>,
}

impl FieldMatch {
    /// Create an empty matcher (matches everything).
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value` (builder pattern).
    pub fn field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    /// Require `field` to reference `entity` (builder pattern).
    pub fn entity(self, field: impl Into<String>, entity: &Entity<'_>) -> Self {
        self.field(field, entity.id().to_value())
    }

    /// Build a matcher from a record.
    pub fn from_record(record: Record) -> Self {
        Self {
            fields: record.into_iter().collect(),
        }
    }

    /// Reduce relation-valued references to their target ids.
    fn normalized(&self, model: &BoundModel<'_>) -> FieldMatch {
        let fields = self
            .fields
            .iter()
            .map(|(field, value)| {
                let target_id = match (model.model().relation(field), value) {
                    (Some(Relation::ForeignKey { target }), Value::Object(embedded)) => model
                        .session()
                        .schema()
                        .model(target)
                        .and_then(|t| embedded.get(t.id_attr()).cloned()),
                    _ => None,
                };
                (field.clone(), target_id.unwrap_or_else(|| value.clone()))
            })
            .collect();
        FieldMatch { fields }
    }

    /// Check a raw record.
    pub fn matches(&self, record: &Record) -> bool {
        self.fields
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }
}

impl TryFrom<Value> for FieldMatch {
    type Error = OrmError;

    fn try_from(value: Value) -> OrmResult<Self> {
        match value {
            Value::Object(record) => Ok(FieldMatch::from_record(record)),
            other => Err(OrmError::invalid_predicate(format!(
                "field match must be an object, found {}",
                crate::error::value_type_name(&other)
            ))),
        }
    }
}

/// Predicate accepted by [`QuerySet::filter`] and [`QuerySet::exclude`].
pub enum Predicate<'p, 'a> {
    /// Boolean test over elements in the current view mode.
    Test(Box<dyn Fn(&Item<'a>) -> bool + 'p>),
    /// Field equality over raw records.
    FieldMatch(FieldMatch),
}

impl<'p, 'a> Predicate<'p, 'a> {
    /// Create a test predicate.
    pub fn test(f: impl Fn(&Item<'a>) -> bool + 'p) -> Self {
        Predicate::Test(Box::new(f))
    }
}

impl From<FieldMatch> for Predicate<'_, '_> {
    fn from(m: FieldMatch) -> Self {
        Predicate::FieldMatch(m)
    }
}

impl fmt::Debug for Predicate<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Test(_) => f.write_str("Predicate::Test(<fn>)"),
            Predicate::FieldMatch(m) => f.debug_tuple("Predicate::FieldMatch").field(m).finish(),
        }
    }
}

/// Sort key accepted by [`QuerySet::order_by`].
pub enum OrderKey<'p, 'a> {
    /// Sort by a record field. Records missing the field sort last.
    Field(String),
    /// Sort by a derived value.
    By(Box<dyn Fn(&Item<'a>) -> Value + 'p>),
}

impl<'p, 'a> OrderKey<'p, 'a> {
    /// Sort by a field.
    pub fn field(name: impl Into<String>) -> Self {
        OrderKey::Field(name.into())
    }

    /// Sort by a derived value.
    pub fn by(f: impl Fn(&Item<'a>) -> Value + 'p) -> Self {
        OrderKey::By(Box::new(f))
    }
}

impl From<&str> for OrderKey<'_, '_> {
    fn from(name: &str) -> Self {
        OrderKey::field(name)
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Direction {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Ordered, immutable view over a subset of one table's ids.
#[derive(Clone)]
pub struct QuerySet<'a> {
    model: BoundModel<'a>,
    ids: Vec<EntityId>,
    view: ViewMode,
}

impl<'a> QuerySet<'a> {
    pub(crate) fn new(model: BoundModel<'a>, ids: Vec<EntityId>, view: ViewMode) -> Self {
        Self { model, ids, view }
    }

    /// The bound model this query set reads from.
    #[inline]
    pub fn model(&self) -> &BoundModel<'a> {
        &self.model
    }

    /// Ids in query order.
    #[inline]
    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    /// Current view mode.
    #[inline]
    pub fn view(&self) -> ViewMode {
        self.view
    }

    /// A copy of this query set.
    pub fn all(&self) -> QuerySet<'a> {
        self.clone()
    }

    /// Number of ids.
    #[inline]
    pub fn count(&self) -> usize {
        self.ids.len()
    }

    /// Check whether any id is present.
    #[inline]
    pub fn exists(&self) -> bool {
        !self.ids.is_empty()
    }

    /// Same ids, raw-record view.
    pub fn with_refs(&self) -> QuerySet<'a> {
        self.with_view(ViewMode::Refs)
    }

    /// Alias of [`QuerySet::with_refs`].
    pub fn refs(&self) -> QuerySet<'a> {
        self.with_refs()
    }

    /// Same ids, wrapped-entity view.
    pub fn with_models(&self) -> QuerySet<'a> {
        self.with_view(ViewMode::Models)
    }

    fn with_view(&self, view: ViewMode) -> QuerySet<'a> {
        QuerySet {
            view,
            ..self.clone()
        }
    }

    fn item(&self, table: &Table, id: &EntityId) -> Option<Item<'a>> {
        let record = table.get(id)?.clone();
        Some(match self.view {
            ViewMode::Refs => Item::Ref(record),
            ViewMode::Models => Item::Model(Entity::new(self.model, id.clone(), record)),
        })
    }

    /// Element at `index`, or `None` when out of range or no longer present.
    pub fn at(&self, index: usize) -> Option<Item<'a>> {
        let id = self.ids.get(index)?;
        self.item(&self.model.table(), id)
    }

    /// First element.
    pub fn first(&self) -> Option<Item<'a>> {
        self.at(0)
    }

    /// Last element.
    pub fn last(&self) -> Option<Item<'a>> {
        self.ids.len().checked_sub(1).and_then(|i| self.at(i))
    }

    /// Apply `f` to every element and collect the results.
    pub fn map<T>(&self, mut f: impl FnMut(Item<'a>) -> T) -> Vec<T> {
        let table = self.model.table();
        self.ids
            .iter()
            .filter_map(|id| self.item(&table, id))
            .map(|item| f(item))
            .collect()
    }

    /// Apply `f` to every element.
    pub fn for_each(&self, mut f: impl FnMut(Item<'a>)) {
        let table = self.model.table();
        for item in self.ids.iter().filter_map(|id| self.item(&table, id)) {
            f(item);
        }
    }

    /// Raw records, regardless of view mode.
    pub fn to_ref_array(&self) -> Vec<Record> {
        let table = self.model.table();
        self.ids
            .iter()
            .filter_map(|id| table.get(id).cloned())
            .collect()
    }

    /// Wrapped entities, regardless of view mode.
    pub fn to_model_array(&self) -> Vec<Entity<'a>> {
        let table = self.model.table();
        self.ids
            .iter()
            .filter_map(|id| {
                table
                    .get(id)
                    .map(|record| Entity::new(self.model, id.clone(), record.clone()))
            })
            .collect()
    }

    /// Keep the ids that pass `predicate`.
    pub fn filter<'p>(&self, predicate: impl Into<Predicate<'p, 'a>>) -> QuerySet<'a> {
        self.select(predicate.into(), true)
    }

    /// Keep the ids that fail `predicate`.
    pub fn exclude<'p>(&self, predicate: impl Into<Predicate<'p, 'a>>) -> QuerySet<'a> {
        self.select(predicate.into(), false)
    }

    fn select(&self, predicate: Predicate<'_, 'a>, keep: bool) -> QuerySet<'a> {
        let table = self.model.table();
        let ids = match predicate {
            Predicate::FieldMatch(m) => {
                let m = m.normalized(&self.model);
                self.ids
                    .iter()
                    .filter(|id| table.get(id).is_some_and(|r| m.matches(r)) == keep)
                    .cloned()
                    .collect()
            }
            Predicate::Test(test) => self
                .ids
                .iter()
                .filter(|id| self.item(&table, id).is_some_and(|item| test(&item)) == keep)
                .cloned()
                .collect(),
        };
        QuerySet::new(self.model, ids, ViewMode::Refs)
    }

    /// Stable sort by `keys`; `directions` pairs up with `keys` and defaults
    /// to ascending.
    pub fn order_by<'p>(
        &self,
        keys: impl IntoIterator<Item = OrderKey<'p, 'a>>,
        directions: impl IntoIterator<Item = Direction>,
    ) -> QuerySet<'a> {
        let keys: Vec<OrderKey<'p, 'a>> = keys.into_iter().collect();
        let mut directions: Vec<Direction> = directions.into_iter().collect();
        directions.resize(keys.len(), Direction::Asc);

        let table = self.model.table();
        let mut rows: Vec<(EntityId, Vec<Option<Value>>)> = self
            .ids
            .iter()
            .filter_map(|id| {
                let record = table.get(id)?;
                let sort_keys = keys
                    .iter()
                    .map(|key| match key {
                        OrderKey::Field(field) => record.get(field).cloned(),
                        OrderKey::By(f) => self.item(&table, id).map(|item| f(&item)),
                    })
                    .collect();
                Some((id.clone(), sort_keys))
            })
            .collect();

        rows.sort_by(|(_, a), (_, b)| {
            a.iter()
                .zip(b)
                .zip(&directions)
                .map(|((x, y), direction)| {
                    let ord = compare_values(x.as_ref(), y.as_ref());
                    // absent values stay last in both directions
                    match (direction, x.is_some() && y.is_some()) {
                        (Direction::Desc, true) => ord.reverse(),
                        _ => ord,
                    }
                })
                .find(|ord| ord.is_ne())
                .unwrap_or(Ordering::Equal)
        });

        let ids = rows.into_iter().map(|(id, _)| id).collect();
        QuerySet::new(self.model, ids, ViewMode::Refs)
    }

    /// Record one UPDATE merging `patch` into every id.
    pub fn update(&self, patch: Record) -> OrmResult<()> {
        self.model.add_update(UpdateRecord::update(
            self.model.name(),
            self.ids.clone(),
            patch,
        ))
    }

    /// Record one DELETE for every id, then run each entity's delete hook.
    ///
    /// The hook runs after the DELETE is logged so that records it enqueues
    /// come after the removal.
    pub fn delete(&self) -> OrmResult<()> {
        let entities = self.to_model_array();
        self.model
            .add_update(UpdateRecord::delete(self.model.name(), self.ids.clone()))?;
        for entity in &entities {
            entity.on_delete()?;
        }
        Ok(())
    }
}

impl PartialEq for QuerySet<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.model.name() == other.model.name() && self.ids == other.ids && self.view == other.view
    }
}

impl fmt::Debug for QuerySet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.model.name())
            .field("ids", &self.ids)
            .field("view", &self.view)
            .finish()
    }
}

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over optional JSON values; absent values sort last.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => compare_present(a, b),
    }
}

fn compare_present(a: &Value, b: &Value) -> Ordering {
    let rank = kind_rank(a).cmp(&kind_rank(b));
    if rank.is_ne() {
        return rank;
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(x, y)| compare_present(x, y))
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => Ordering::Equal,
    }
}
