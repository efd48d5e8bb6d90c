//! Table descriptors, reducers and the registration-ordered schema.

use crate::{OrmError, OrmResult, OrmState, Session, Table};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A dispatched action: `{ "type": ..., "payload": ... }`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Action payload.
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    /// Create an action.
    pub fn new(kind: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// Check the action type.
    #[inline]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Per-table reducer run by [`Session::get_next_state`].
///
/// Returning `Ok(Some(table))` installs `table` as the next value and counts
/// every update recorded so far for this table as consumed. Returning
/// `Ok(None)` asks the session to apply the recorded updates itself.
pub trait TableReducer {
    /// Compute the next table value, or `None` to fall back to the update log.
    fn reduce(
        &self,
        table: &Arc<Table>,
        action: &Action,
        model: &Model,
        session: &Session<'_>,
    ) -> OrmResult<Option<Arc<Table>>>;
}

/// Adapter turning a closure into a [`TableReducer`].
pub struct FnReducer<F>(F);

impl<F> TableReducer for FnReducer<F>
where
    F: Fn(&Arc<Table>, &Action, &Model, &Session<'_>) -> OrmResult<Option<Arc<Table>>>,
{
    fn reduce(
        &self,
        table: &Arc<Table>,
        action: &Action,
        model: &Model,
        session: &Session<'_>,
    ) -> OrmResult<Option<Arc<Table>>> {
        (self.0)(table, action, model, session)
    }
}

/// A relation declared on a model field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Relation {
    /// The field holds the id of one `target` entity.
    ForeignKey {
        /// Target model name.
        target: String,
    },
    /// The field links to many `target` entities through a link table.
    ManyToMany {
        /// Target model name.
        target: String,
        /// Link table name.
        through: String,
        /// Link column holding the declaring entity's id.
        from_field: String,
        /// Link column holding the target entity's id.
        to_field: String,
    },
}

impl Relation {
    /// Target model name.
    #[inline]
    pub fn target(&self) -> &str {
        match self {
            Relation::ForeignKey { target } | Relation::ManyToMany { target, .. } => target,
        }
    }
}

/// Descriptor of one entity table.
#[derive(Clone)]
pub struct Model {
    name: String,
    id_attribute: String,
    relations: Vec<(String, Relation)>,
    reducer: Option<Arc<dyn TableReducer>>,
}

impl Model {
    /// Create a model with the default `id` attribute and no relations.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_attribute: "id".to_string(),
            relations: Vec::new(),
            reducer: None,
        }
    }

    /// Set the id attribute (builder pattern).
    pub fn id_attribute(mut self, field: impl Into<String>) -> Self {
        self.id_attribute = field.into();
        self
    }

    /// Declare a foreign-key field (builder pattern).
    pub fn fk(mut self, field: impl Into<String>, target: impl Into<String>) -> Self {
        self.relations.push((
            field.into(),
            Relation::ForeignKey {
                target: target.into(),
            },
        ));
        self
    }

    /// Declare a many-to-many field (builder pattern).
    ///
    /// The link table is named `{Model}{Field}` with the columns
    /// `from{Model}Id` and `to{Target}Id`.
    pub fn many(mut self, field: impl Into<String>, target: impl Into<String>) -> Self {
        let field = field.into();
        let target = target.into();
        let relation = Relation::ManyToMany {
            through: format!("{}{}", self.name, capitalize(&field)),
            from_field: format!("from{}Id", self.name),
            to_field: format!("to{target}Id"),
            target,
        };
        self.relations.push((field, relation));
        self
    }

    /// Attach a reducer (builder pattern).
    pub fn reducer(mut self, reducer: impl TableReducer + 'static) -> Self {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    /// Attach a closure reducer (builder pattern).
    pub fn reduce_with<F>(self, f: F) -> Self
    where
        F: Fn(&Arc<Table>, &Action, &Model, &Session<'_>) -> OrmResult<Option<Arc<Table>>>
            + 'static,
    {
        self.reducer(FnReducer(f))
    }

    /// Table name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field holding an entity's identity value.
    #[inline]
    pub fn id_attr(&self) -> &str {
        &self.id_attribute
    }

    /// Declared relations in declaration order.
    #[inline]
    pub fn relations(&self) -> &[(String, Relation)] {
        &self.relations
    }

    /// Look up a relation by field name.
    pub fn relation(&self, field: &str) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, relation)| relation)
    }

    /// The reducer, if any.
    #[inline]
    pub fn table_reducer(&self) -> Option<&Arc<dyn TableReducer>> {
        self.reducer.as_ref()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("id_attribute", &self.id_attribute)
            .field("relations", &self.relations)
            .field("reducer", &self.reducer.as_ref().map(|_| "<reducer>"))
            .finish()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Registration-ordered set of models.
#[derive(Clone, Debug)]
pub struct Schema {
    models: Vec<Model>,
    index: HashMap<String, usize>,
}

/// Builder for [`Schema`]; validation happens in [`SchemaBuilder::build`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    models: Vec<Model>,
}

impl SchemaBuilder {
    /// Register a model (builder pattern).
    pub fn register(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    /// Validate and build the schema.
    ///
    /// Link tables for many-to-many fields are registered right after their
    /// declaring model.
    pub fn build(self) -> OrmResult<Schema> {
        let mut models = Vec::new();
        for model in self.models {
            let links: Vec<Model> = model
                .relations
                .iter()
                .filter_map(|(_, relation)| match relation {
                    Relation::ManyToMany {
                        target,
                        through,
                        from_field,
                        to_field,
                    } => Some(
                        Model::new(through.clone())
                            .fk(from_field.clone(), model.name.clone())
                            .fk(to_field.clone(), target.clone()),
                    ),
                    Relation::ForeignKey { .. } => None,
                })
                .collect();
            models.push(model);
            models.extend(links);
        }

        let mut index = HashMap::new();
        for (position, model) in models.iter().enumerate() {
            if index.insert(model.name.clone(), position).is_some() {
                return Err(OrmError::DuplicateModel {
                    name: model.name.clone(),
                });
            }
        }

        for model in &models {
            for (field, relation) in &model.relations {
                if !index.contains_key(relation.target()) {
                    return Err(OrmError::unknown_relation(&model.name, field));
                }
            }
        }

        Ok(Schema { models, index })
    }
}

impl Schema {
    /// Start building a schema.
    #[inline]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Models in registration order, link tables included.
    #[inline]
    pub fn models(&self) -> &[Model] {
        &self.models
    }

    /// Look up a model by table name.
    pub fn model(&self, name: &str) -> Option<&Model> {
        self.index.get(name).map(|&i| &self.models[i])
    }

    /// A state tree with one empty table per model.
    pub fn empty_state(&self) -> OrmState {
        self.models.iter().fold(OrmState::new(), |state, model| {
            state.with_table(model.name.clone(), Table::new())
        })
    }

    /// Many-to-many relations, on any model, whose target is `name`.
    pub(crate) fn incoming_many<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = (&'a Model, &'a Relation)> + 'a {
        self.models.iter().flat_map(move |model| {
            model
                .relations
                .iter()
                .filter(move |(_, relation)| {
                    matches!(relation, Relation::ManyToMany { target, .. } if target == name)
                })
                .map(move |(_, relation)| (model, relation))
        })
    }
}
