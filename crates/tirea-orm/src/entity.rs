//! Wrapped entities: one row bound to its model and session.

use crate::schema::Relation;
use crate::{
    BoundModel, EntityId, FieldMatch, OrmError, OrmResult, Predicate, QuerySet, Record,
    UpdateRecord, ViewMode,
};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// A single row together with the model and session it was read through.
///
/// The record is a snapshot taken when the entity was materialized. Updates
/// made through the entity are merged into the snapshot and logged with the
/// session; they reach the state tree on the next `get_next_state`.
#[derive(Clone)]
pub struct Entity<'a> {
    model: BoundModel<'a>,
    id: EntityId,
    record: Record,
}

/// Resolved columns of a many-to-many field.
struct Link<'a> {
    table: BoundModel<'a>,
    target: BoundModel<'a>,
    from_field: &'a str,
    to_field: &'a str,
}

impl<'a> Entity<'a> {
    pub(crate) fn new(model: BoundModel<'a>, id: EntityId, record: Record) -> Self {
        Self { model, id, record }
    }

    /// Identity value of the row.
    #[inline]
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// The bound model the row was read through.
    #[inline]
    pub fn model(&self) -> &BoundModel<'a> {
        &self.model
    }

    /// The record snapshot.
    #[inline]
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Read one field of the snapshot.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.record.get(field)
    }

    /// Consume the entity, keeping only its record snapshot.
    pub fn into_record(self) -> Record {
        self.record
    }

    /// Log an UPDATE for this entity and merge `patch` into the snapshot.
    ///
    /// Foreign keys given as embedded records are reduced to ids. Values for
    /// many-to-many fields replace the current links.
    pub fn update(&mut self, patch: Record) -> OrmResult<()> {
        let mut props = Record::new();
        let mut links = Vec::new();
        for (field, value) in patch {
            match self.model.model().relation(&field) {
                Some(Relation::ManyToMany { .. }) => links.push((field, value)),
                Some(Relation::ForeignKey { target }) => {
                    let value = self.model.reduce_reference(target, value);
                    props.insert(field, value);
                }
                None => {
                    props.insert(field, value);
                }
            }
        }

        if !props.is_empty() {
            self.model.add_update(UpdateRecord::update(
                self.model.name(),
                vec![self.id.clone()],
                props.clone(),
            ))?;
            self.record.extend(props);
        }

        for (field, value) in links {
            let ids = related_ids(self.model.name(), &field, value)?;
            self.set_related(&field, ids)?;
        }
        Ok(())
    }

    /// Log a DELETE for this entity, then run its delete hook.
    pub fn delete(&self) -> OrmResult<()> {
        self.model
            .add_update(UpdateRecord::delete(self.model.name(), vec![self.id.clone()]))?;
        self.on_delete()
    }

    /// Delete hook: removes every link row that references this entity,
    /// through its own many-to-many fields and through fields of other models
    /// that point here.
    pub fn on_delete(&self) -> OrmResult<()> {
        let session = self.model.session();
        let id = self.id.to_value();

        for (_, relation) in self.model.model().relations() {
            if let Relation::ManyToMany {
                through, from_field, ..
            } = relation
            {
                delete_existing(
                    session
                        .model(through)?
                        .all()
                        .filter(FieldMatch::new().field(from_field.as_str(), id.clone())),
                )?;
            }
        }

        for (_, relation) in session.schema().incoming_many(self.model.name()) {
            if let Relation::ManyToMany {
                through, to_field, ..
            } = relation
            {
                delete_existing(
                    session
                        .model(through)?
                        .all()
                        .filter(FieldMatch::new().field(to_field.as_str(), id.clone())),
                )?;
            }
        }
        Ok(())
    }

    /// The entity a foreign-key field points at, if it still exists.
    pub fn foreign(&self, field: &str) -> OrmResult<Option<Entity<'a>>> {
        let target = match self.model.model().relation(field) {
            Some(Relation::ForeignKey { target }) => target,
            _ => return Err(OrmError::unknown_relation(self.model.name(), field)),
        };
        let target = self.model.session().model(target)?;
        Ok(self
            .get(field)
            .and_then(EntityId::from_value)
            .and_then(|id| target.with_id(id)))
    }

    /// Target entities linked through a many-to-many field, in link order.
    pub fn related(&self, field: &str) -> OrmResult<QuerySet<'a>> {
        let link = self.link(field)?;
        let target_table = link.target.table();
        let ids = self
            .linked_ids(&link)
            .into_iter()
            .filter(|id| target_table.contains(id))
            .collect();
        Ok(QuerySet::new(link.target, ids, ViewMode::Models))
    }

    /// Link this entity to `ids`; existing links are skipped.
    pub fn add_related<I>(&self, field: &str, ids: I) -> OrmResult<()>
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        let link = self.link(field)?;
        let mut linked: HashSet<EntityId> = self.linked_ids(&link).into_iter().collect();
        for id in ids {
            let id = id.into();
            if !linked.insert(id.clone()) {
                continue;
            }
            let mut row = Record::new();
            row.insert(link.from_field.to_string(), self.id.to_value());
            row.insert(link.to_field.to_string(), id.to_value());
            link.table.create(row)?;
        }
        Ok(())
    }

    /// Remove the links to `ids`.
    pub fn remove_related<I>(&self, field: &str, ids: I) -> OrmResult<()>
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        let link = self.link(field)?;
        let targets: HashSet<EntityId> = ids.into_iter().map(Into::into).collect();
        let to_field = link.to_field;
        delete_existing(self.links_from(&link).filter(Predicate::test(move |item| {
            item.get(to_field)
                .and_then(EntityId::from_value)
                .is_some_and(|id| targets.contains(&id))
        })))
    }

    /// Remove every link of a many-to-many field.
    pub fn clear_related(&self, field: &str) -> OrmResult<()> {
        let link = self.link(field)?;
        delete_existing(self.links_from(&link))
    }

    /// Make `ids` the exact link set of a many-to-many field.
    pub fn set_related(&self, field: &str, ids: Vec<EntityId>) -> OrmResult<()> {
        let link = self.link(field)?;
        let current: HashSet<EntityId> = self.linked_ids(&link).into_iter().collect();
        let wanted: HashSet<&EntityId> = ids.iter().collect();

        let stale: Vec<EntityId> = current
            .iter()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();
        self.remove_related(field, stale)?;
        self.add_related(field, ids)
    }

    fn link(&self, field: &str) -> OrmResult<Link<'a>> {
        match self.model.model().relation(field) {
            Some(Relation::ManyToMany {
                target,
                through,
                from_field,
                to_field,
            }) => {
                let session = self.model.session();
                Ok(Link {
                    table: session.model(through)?,
                    target: session.model(target)?,
                    from_field,
                    to_field,
                })
            }
            _ => Err(OrmError::unknown_relation(self.model.name(), field)),
        }
    }

    fn links_from(&self, link: &Link<'a>) -> QuerySet<'a> {
        link.table
            .all()
            .filter(FieldMatch::new().field(link.from_field, self.id.to_value()))
    }

    fn linked_ids(&self, link: &Link<'a>) -> Vec<EntityId> {
        self.links_from(link)
            .to_ref_array()
            .iter()
            .filter_map(|row| row.get(link.to_field).and_then(EntityId::from_value))
            .collect()
    }
}

fn delete_existing(rows: QuerySet<'_>) -> OrmResult<()> {
    if rows.exists() {
        rows.delete()?;
    }
    Ok(())
}

fn related_ids(table: &str, field: &str, value: Value) -> OrmResult<Vec<EntityId>> {
    let values = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    values
        .iter()
        .map(|v| {
            EntityId::from_value(v).ok_or_else(|| {
                OrmError::malformed_update(
                    "UPDATE",
                    table,
                    format!("`{field}` must list related ids"),
                )
            })
        })
        .collect()
}

impl PartialEq for Entity<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.model.name() == other.model.name() && self.id == other.id && self.record == other.record
    }
}

impl fmt::Debug for Entity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("model", &self.model.name())
            .field("id", &self.id)
            .field("record", &self.record)
            .finish()
    }
}
