//! End-to-end dispatch cycles: query, log, reduce, apply.
//!
//! These tests verify that:
//! 1. QuerySet writes only reach the state tree through `get_next_state`
//! 2. Tables nobody wrote to keep their identity
//! 3. Reducers and the automatic fallback cooperate in schema order

use serde_json::{json, Value};
use std::sync::Arc;
use tirea_orm::{
    Action, Direction, EntityId, FieldMatch, Model, NextStateOptions, OrderKey, OrmError,
    OrmState, Predicate, Record, Schema, Session, Table, UpdateRecord, UpdateType,
};

fn rec(v: Value) -> Record {
    v.as_object().cloned().unwrap()
}

fn books_table() -> Table {
    Table::from_records(
        "Book",
        "id",
        vec![
            rec(json!({"id": 1, "title": "Dune", "rating": 3, "done": false})),
            rec(json!({"id": 2, "title": "Emma", "rating": 5, "done": false})),
            rec(json!({"id": 3, "title": "Ulysses", "rating": 4, "done": false})),
        ],
    )
    .unwrap()
}

fn library() -> Schema {
    Schema::builder()
        .register(Model::new("Author"))
        .register(Model::new("Genre"))
        .register(Model::new("Book").fk("author", "Author").many("genres", "Genre"))
        .build()
        .unwrap()
}

fn seeded(schema: &Schema) -> OrmState {
    schema.empty_state().with_table("Book", books_table())
}

fn ids(values: &[i64]) -> Vec<EntityId> {
    values.iter().copied().map(EntityId::Int).collect()
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_order_by_rating_ascending_and_descending() {
    let schema = library();
    let session = Session::new(&schema, seeded(&schema));
    let books = session.model("Book").unwrap();

    let asc = books.all().order_by([OrderKey::from("rating")], [Direction::Asc]);
    assert_eq!(asc.ids(), ids(&[1, 3, 2]).as_slice());

    let desc = books.all().order_by([OrderKey::from("rating")], [Direction::Desc]);
    assert_eq!(desc.ids(), ids(&[2, 3, 1]).as_slice());
}

#[test]
fn test_order_by_key_function_sees_entities() {
    let schema = library();
    let session = Session::new(&schema, seeded(&schema));
    let books = session.model("Book").unwrap();

    let by_title_len = books.all().order_by(
        [OrderKey::by(|item| {
            assert!(item.as_entity().is_some());
            json!(item.get("title").and_then(Value::as_str).map_or(0, str::len))
        })],
        [Direction::Asc],
    );
    assert_eq!(by_title_len.ids(), ids(&[1, 2, 3]).as_slice());
}

// ============================================================================
// Update / delete through the log
// ============================================================================

#[test]
fn test_update_all_marks_every_record() {
    let schema = library();
    let state = seeded(&schema);
    let session = Session::new(&schema, state.clone());

    session
        .model("Book")
        .unwrap()
        .all()
        .update(rec(json!({"done": true})))
        .unwrap();

    let logged = session.updates_for("Book");
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].kind, UpdateType::Update);
    assert_eq!(logged[0].payload, json!({"ids": [1, 2, 3], "props": {"done": true}}));

    let next = session.get_next_state(NextStateOptions::default()).unwrap();
    let table = next.table("Book").unwrap();
    for (_, row) in table.iter() {
        assert_eq!(row["done"], true);
    }
    assert_eq!(table.get(&EntityId::Int(2)).unwrap()["title"], "Emma");
    assert!(!next.shares_table(&state, "Book"));
    assert!(next.shares_table(&state, "Author"));
    // input untouched
    assert_eq!(state.table("Book").unwrap().get(&EntityId::Int(1)).unwrap()["done"], false);
}

#[test]
fn test_delete_single_id() {
    let schema = library();
    let session = Session::new(&schema, seeded(&schema));

    let target = session
        .model("Book")
        .unwrap()
        .all()
        .filter(Predicate::test(|item| item.get("id") == Some(&json!(2))));
    assert_eq!(target.ids(), ids(&[2]).as_slice());
    target.delete().unwrap();

    let next = session.get_next_state(NextStateOptions::default()).unwrap();
    let table = next.table("Book").unwrap();
    assert_eq!(table.len(), 2);
    assert!(!table.ids().iter().any(|id| id == &EntityId::Int(2)));
    assert!(table.get(&EntityId::Int(2)).is_none());
}

#[test]
fn test_conflicting_updates_last_write_wins() {
    let schema = library();
    let session = Session::new(&schema, seeded(&schema));
    let books = session.model("Book").unwrap();

    let one = books.all().filter(FieldMatch::new().field("id", 1));
    one.update(rec(json!({"title": "first", "rating": 1}))).unwrap();
    one.update(rec(json!({"title": "second"}))).unwrap();

    let next = session.get_next_state(NextStateOptions::default()).unwrap();
    let row = next.table("Book").unwrap().get(&EntityId::Int(1)).unwrap().clone();
    assert_eq!(row["title"], "second");
    assert_eq!(row["rating"], 1);
}

#[test]
fn test_fallback_applies_removals_without_reducer() {
    let schema = library();
    let session = Session::with_action(&schema, seeded(&schema), Action::new("PRUNE", json!({})));
    let books = session.model("Book").unwrap();

    books.with_id(1).unwrap().delete().unwrap();
    books.with_id(3).unwrap().delete().unwrap();
    assert_eq!(session.updates_for("Book").len(), 2);

    let next = session.reduce().unwrap();
    let table = next.table("Book").unwrap();
    assert_eq!(table.ids().iter().cloned().collect::<Vec<_>>(), ids(&[2]));
}

#[test]
fn test_cascade_records_follow_the_delete() {
    let schema = library();
    let session = Session::new(&schema, seeded(&schema));
    session
        .model("Genre")
        .unwrap()
        .create(rec(json!({"id": 7, "name": "classic"})))
        .unwrap();
    session
        .model("Book")
        .unwrap()
        .with_id(2)
        .unwrap()
        .add_related("genres", [7])
        .unwrap();
    let state = session.get_next_state(NextStateOptions::default()).unwrap();
    assert_eq!(state.table("BookGenres").unwrap().len(), 1);

    let session = Session::new(&schema, state);
    session
        .model("Book")
        .unwrap()
        .all()
        .filter(FieldMatch::new().field("id", 2))
        .delete()
        .unwrap();

    let order: Vec<(UpdateType, String)> = session
        .pending_updates()
        .iter()
        .map(|u| (u.kind, u.table().to_string()))
        .collect();
    assert_eq!(
        order,
        vec![
            (UpdateType::Delete, "Book".to_string()),
            (UpdateType::Delete, "BookGenres".to_string()),
        ]
    );

    let next = session.get_next_state(NextStateOptions::default()).unwrap();
    assert!(next.table("BookGenres").unwrap().is_empty());
    assert!(next.table("Genre").unwrap().contains(&EntityId::Int(7)));
}

// ============================================================================
// Reducers
// ============================================================================

fn counter_schema() -> Schema {
    Schema::builder()
        .register(Model::new("Book"))
        .register(Model::new("Shelf").reduce_with(|_table, action, _model, _session| {
            if action.is("CLEAR_SHELVES") {
                Ok(Some(Arc::new(Table::new())))
            } else if action.is("FAIL") {
                Err(OrmError::invalid_predicate("reducer refused"))
            } else {
                Ok(None)
            }
        }))
        .register(Model::new("Audit").reduce_with(|_table, action, _model, session| {
            if action.is("CLEAR_SHELVES") {
                // Book was already visited; this record lands in the post pass.
                session
                    .model("Book")?
                    .all()
                    .update(rec(json!({"shelved": false})))?;
            }
            Ok(None)
        }))
        .build()
        .unwrap()
}

fn counter_state(schema: &Schema) -> OrmState {
    let shelves = Table::from_records("Shelf", "id", vec![rec(json!({"id": 1}))]).unwrap();
    schema
        .empty_state()
        .with_table("Book", books_table())
        .with_table("Shelf", shelves)
}

#[test]
fn test_reducer_result_replaces_table_and_consumes_records() {
    let schema = counter_schema();
    let state = counter_state(&schema);
    let session = Session::with_action(&schema, state.clone(), Action::new("CLEAR_SHELVES", Value::Null));
    session
        .model("Shelf")
        .unwrap()
        .create(rec(json!({"id": 2})))
        .unwrap();

    let next = session.get_next_state(NextStateOptions::default()).unwrap();
    assert!(next.table("Shelf").unwrap().is_empty());

    // post pass picked up the record the Audit reducer enqueued for Book
    let books = next.table("Book").unwrap();
    assert!(books.iter().all(|(_, row)| row["shelved"] == false));
    assert!(next.shares_table(&state, "Audit"));
}

#[test]
fn test_reducer_none_falls_back_to_log() {
    let schema = counter_schema();
    let session = Session::with_action(&schema, counter_state(&schema), Action::new("NOOP", Value::Null));
    session
        .model("Shelf")
        .unwrap()
        .create(rec(json!({"id": 2})))
        .unwrap();

    let next = session.get_next_state(NextStateOptions::default()).unwrap();
    assert_eq!(next.table("Shelf").unwrap().len(), 2);
}

#[test]
fn test_reducers_can_be_disabled() {
    let schema = counter_schema();
    let state = counter_state(&schema);
    let session = Session::with_action(&schema, state, Action::new("CLEAR_SHELVES", Value::Null));

    let next = session
        .get_next_state(NextStateOptions::default().run_reducers(false))
        .unwrap();
    assert_eq!(next.table("Shelf").unwrap().len(), 1);
}

#[test]
fn test_reducer_error_aborts_cycle() {
    let schema = counter_schema();
    let state = counter_state(&schema);
    let session = Session::with_action(&schema, state.clone(), Action::new("FAIL", Value::Null));
    session
        .model("Book")
        .unwrap()
        .all()
        .delete()
        .unwrap();

    let err = session.get_next_state(NextStateOptions::default()).unwrap_err();
    assert!(matches!(err, OrmError::InvalidPredicate { .. }));
    assert_eq!(session.pending_len(), 0);
    assert_eq!(session.state(), state);
}

// ============================================================================
// Wire shape
// ============================================================================

#[test]
fn test_logged_records_serialize_to_wire_shape() {
    let schema = library();
    let session = Session::new(&schema, seeded(&schema));
    session
        .model("Book")
        .unwrap()
        .all()
        .exclude(FieldMatch::new().field("rating", 5))
        .update(rec(json!({"done": true})))
        .unwrap();

    let wire = serde_json::to_value(&session.pending_updates()).unwrap();
    assert_eq!(
        wire,
        json!([{
            "type": "UPDATE",
            "payload": {"ids": [1, 3], "props": {"done": true}},
            "meta": {"name": "Book"}
        }])
    );

    let parsed: Vec<UpdateRecord> = serde_json::from_value(wire).unwrap();
    assert_eq!(parsed, session.pending_updates());
}

#[test]
fn test_unknown_model_is_rejected() {
    let schema = library();
    let session = Session::new(&schema, seeded(&schema));
    assert!(matches!(
        session.model("Magazine"),
        Err(OrmError::UnknownTable { name }) if name == "Magazine"
    ));
}
