//! A metadata-driven relational data-access layer.
//!
//! Tables are described once as schemas (keys, fields, value converters), and everything else is derived from that
//! description: the SQL statements, the value conversions, the query-result caching, and a declarative synchronizer
//! that reconciles a scoped slice of a table against a desired item list.
//!
//! The crate is backend-agnostic behind the [`driver::Executor`] trait; [`sqlite`] provides the bundled concrete
//! backend.  Typical usage goes through a [`store::DataStore`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabular_datastore::sqlite::{SqliteConfig, SqliteExecutor};
//! use tabular_datastore::store::DataStore;
//!
//! # async fn example() -> tabular_datastore::Result<()> {
//! let mut store = DataStore::new();
//! store.register_default_backend(Arc::new(SqliteExecutor::new(SqliteConfig::in_memory())));
//! store.define_table("users", |t| {
//!     t.key("projectid")?;
//!     t.key("name")?;
//!     t.field("config")?.complex();
//!     Ok(())
//! })?;
//! store.init().await?;
//!
//! let users = store.table("users")?;
//! # let _ = users;
//! # Ok(())
//! # }
//! ```
pub mod accessor;
pub mod cache;
pub mod driver;
pub mod errors;
pub mod hash;
pub mod schema;
pub mod sqlite;
pub mod statements;
pub mod store;
pub mod sync;
pub mod table;
pub mod util;
pub mod values;

pub use errors::{DatastoreError, Result};
pub use values::Item;
