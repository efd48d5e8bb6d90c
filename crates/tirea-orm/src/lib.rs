//! Normalized in-memory entity store with lazy query sets and batched,
//! copy-on-write updates.
//!
//! `tirea-orm` keeps every entity table as an ordered id list plus an
//! id→record map inside an immutable state tree. Reads go through chainable
//! [`QuerySet`]s; writes never touch the tree directly but append
//! [`UpdateRecord`]s to the session's log. Folding the log produces the next
//! tree, sharing every table nothing wrote to.
//!
//! # Core Concepts
//!
//! - **Schema / Model**: registration-ordered table descriptors with relations and reducers
//! - **Session**: one dispatch cycle; hands out bound models and owns the update log
//! - **QuerySet**: immutable view over an ordered id list
//! - **Entity**: one row bound to its model, with relation helpers
//! - **UpdateRecord**: the serializable unit of change (`{type, payload, meta}`)
//!
//! # Deterministic State Transitions
//!
//! ```text
//! State' = get_next_state(State, Action, Log)
//! ```
//!
//! - The input tree is never mutated
//! - Tables without applicable records keep their identity in the output
//!
//! # Quick Start
//!
//! ```
//! use tirea_orm::{Direction, EntityId, Model, NextStateOptions, OrderKey, Schema, Session};
//! use serde_json::json;
//!
//! let schema = Schema::builder().register(Model::new("Book")).build().unwrap();
//! let session = Session::new(&schema, schema.empty_state());
//! let books = session.model("Book").unwrap();
//! for rating in [3, 5, 4] {
//!     books.create(json!({"rating": rating}).as_object().cloned().unwrap()).unwrap();
//! }
//! let state = session.get_next_state(NextStateOptions::default()).unwrap();
//!
//! let session = Session::new(&schema, state);
//! let sorted = session
//!     .model("Book")
//!     .unwrap()
//!     .all()
//!     .order_by([OrderKey::from("rating")], [Direction::Desc]);
//! assert_eq!(sorted.ids(), &[EntityId::Int(2), EntityId::Int(3), EntityId::Int(1)]);
//! ```

mod entity;
mod error;
pub mod ops;
mod query;
mod schema;
mod session;
mod table;
mod transaction;
mod update;

pub use entity::Entity;
pub use error::{value_type_name, OrmError, OrmResult};
pub use query::{Direction, FieldMatch, Item, OrderKey, Predicate, QuerySet, ViewMode};
pub use schema::{Action, FnReducer, Model, Relation, Schema, SchemaBuilder, TableReducer};
pub use session::{BoundModel, NextStateOptions, Session, SessionConfig};
pub use table::{record_id, EntityId, OrmState, Record, Table, TableMeta};
pub use transaction::Transaction;
pub use update::{UpdateAction, UpdateMeta, UpdateRecord, UpdateType};

// Re-export serde_json::Value for convenience
pub use serde_json::Value;
