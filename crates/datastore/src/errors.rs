//! The error taxonomy of the datastore.
//!
//! Configuration mistakes (unknown columns/tables, missing backends, misuse of a closed cache) are all fatal and
//! surface immediately, before any I/O happens where possible.  Duplicate-key conflicts and zero-rows-affected
//! updates/deletes are *not* errors; those come back as `None` results from the table driver instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DatastoreError {
    #[error("Unknown column {column} on table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Table {0} has no updatable columns")]
    NotUpdatable(String),

    #[error("Table {0} is not bound to a backend")]
    DriverNotConfigured(String),

    #[error("Table {table} is bound to unrecognized backend {backend}")]
    UnsupportedBackend { table: String, backend: String },

    #[error("Transactions may not span more than one backend")]
    CrossBackendTransaction,

    #[error("Transactions must name at least one table")]
    EmptyTransaction,

    #[error("The query cache was closed")]
    CacheClosed,

    #[error("Duplicate column {column} on table {table}")]
    DuplicateColumn { table: String, column: String },

    #[error("Table {table} already has an auto-generated key; {column} cannot be another")]
    DuplicateAutoGeneratedKey { table: String, column: String },

    #[error("Column {column} on table {table} is auto-generated but not a key")]
    AutoGeneratedNonKey { table: String, column: String },

    #[error("{0:?} is not a valid SQL identifier")]
    InvalidIdentifier(String),

    #[error("Unsupported comparison operator {0:?}")]
    InvalidOperator(String),

    #[error("Unable to build a statement: {0}")]
    Template(#[from] tera::Error),

    #[error("Executor error: {0}")]
    Executor(String),
}

pub type Result<T, E = DatastoreError> = std::result::Result<T, E>;
