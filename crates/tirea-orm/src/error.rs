//! Error types for tirea-orm operations.

use thiserror::Error;

/// Result type alias for tirea-orm operations.
pub type OrmResult<T> = Result<T, OrmError>;

/// Errors that can occur while querying or updating the store.
#[derive(Debug, Error)]
pub enum OrmError {
    /// No table is registered under the given name.
    #[error("unknown table: {name}")]
    UnknownTable {
        /// The requested table name.
        name: String,
    },

    /// A model was registered twice.
    #[error("model already registered: {name}")]
    DuplicateModel {
        /// The duplicated model name.
        name: String,
    },

    /// A relation field is unknown or points at an unregistered model.
    #[error("unknown relation {model}.{field}")]
    UnknownRelation {
        /// The declaring model.
        model: String,
        /// The relation field.
        field: String,
    },

    /// A predicate could not be interpreted.
    #[error("invalid predicate: {message}")]
    InvalidPredicate {
        /// Description of what went wrong.
        message: String,
    },

    /// An update record's payload does not match its kind.
    #[error("malformed {kind} update for table {table}: {message}")]
    MalformedUpdate {
        /// Update kind tag.
        kind: &'static str,
        /// Target table.
        table: String,
        /// Description of what went wrong.
        message: String,
    },

    /// A record carries no usable id value.
    #[error("record in table {table} has no usable `{id_attribute}` value")]
    MissingId {
        /// Target table.
        table: String,
        /// The id attribute that was expected.
        id_attribute: String,
    },

    /// No integer id is left to allocate for a table.
    #[error("no integer ids left to allocate in table {table}")]
    IdSpaceExhausted {
        /// Target table.
        table: String,
    },

    /// `get_next_state` was re-entered while a batch was open.
    #[error("session is already computing its next state")]
    SessionBusy,

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrmError {
    /// Create an unknown table error.
    #[inline]
    pub fn unknown_table(name: impl Into<String>) -> Self {
        OrmError::UnknownTable { name: name.into() }
    }

    /// Create an unknown relation error.
    #[inline]
    pub fn unknown_relation(model: impl Into<String>, field: impl Into<String>) -> Self {
        OrmError::UnknownRelation {
            model: model.into(),
            field: field.into(),
        }
    }

    /// Create an invalid predicate error.
    #[inline]
    pub fn invalid_predicate(message: impl Into<String>) -> Self {
        OrmError::InvalidPredicate {
            message: message.into(),
        }
    }

    /// Create a malformed update error.
    #[inline]
    pub fn malformed_update(
        kind: &'static str,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        OrmError::MalformedUpdate {
            kind,
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a missing id error.
    #[inline]
    pub fn missing_id(table: impl Into<String>, id_attribute: impl Into<String>) -> Self {
        OrmError::MissingId {
            table: table.into(),
            id_attribute: id_attribute.into(),
        }
    }
}

/// Get the type name of a JSON value.
#[inline]
pub fn value_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
