//! The executor contract and the query-options surface.
//!
//! The datastore never talks to a database directly; it hands parameterized SQL text and an ordered parameter list to
//! an [`Executor`] and gets back either rows or an affected-row count plus the generated insert id.  Connection
//! management, pooling, timeouts and cancellation all live behind this trait.
use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{DatastoreError, Result};
use crate::values::Item;

/// A projection: which columns a query should return.
#[derive(Debug, Clone, Default)]
pub struct FieldsOptions {
    pub fields: Vec<String>,
}

/// One ad hoc comparison filter, e.g. `age >= 21`.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    pub name: String,
    pub operator: String,
    pub value: Value,
}

/// Ad hoc comparison filters beyond the plain equality target.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub fields: Vec<FieldFilter>,
}

#[derive(Debug, Clone)]
pub struct FieldOrder {
    pub name: String,
    pub asc: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OrderOptions {
    pub fields: Vec<FieldOrder>,
}

/// Options for the read paths.
///
/// Queries carrying ad hoc filters, an ordering or a row limit have an unbounded shape; they are compiled fresh on
/// every call and bypass the query-result cache.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub skip_cache: bool,
    pub fields: Option<FieldsOptions>,
    pub filters: Option<FilterOptions>,
    pub order: Option<OrderOptions>,
    pub limit_count: Option<u64>,
}

/// What an executor hands back: rows for reads, counts for writes.
#[derive(Debug)]
pub enum ExecOutcome {
    Rows(Vec<Item>),
    Write {
        affected_rows: u64,
        insert_id: Option<i64>,
    },
}

impl ExecOutcome {
    /// The rows of a read, or an error if the statement turned out to be a write.
    pub fn into_rows(self) -> Result<Vec<Item>> {
        match self {
            ExecOutcome::Rows(rows) => Ok(rows),
            ExecOutcome::Write { .. } => Err(DatastoreError::Executor(
                "expected rows but the statement was a write".to_string(),
            )),
        }
    }

    /// The affected-row count and insert id of a write, or an error for a read.
    pub fn into_write(self) -> Result<(u64, Option<i64>)> {
        match self {
            ExecOutcome::Write {
                affected_rows,
                insert_id,
            } => Ok((affected_rows, insert_id)),
            ExecOutcome::Rows(_) => Err(DatastoreError::Executor(
                "expected a write but the statement returned rows".to_string(),
            )),
        }
    }
}

/// Invoked when an executor transitions to the connected state.
pub type ConnectHook = Box<dyn Fn() + Send + Sync>;

/// The narrow contract the datastore requires of a storage backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one parameterized statement.
    async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<ExecOutcome>;

    async fn connect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Register a connectivity callback.  Fires immediately if already connected.
    fn on_connect(&self, hook: ConnectHook);
}
