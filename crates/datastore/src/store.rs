//! The datastore facade.
//!
//! A `DataStore` ties the pieces together: the schema registry, the named backend executors, and the per-table shared
//! state (statement store plus query-result cache).  Setup is synchronous and mutable (register backends, define
//! tables, tune caches); after `init` the store is shared immutably and hands out table drivers.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use log::*;

use crate::cache::CacheOptions;
use crate::driver::{ConnectHook, Executor};
use crate::errors::{DatastoreError, Result};
use crate::schema::{SchemaRegistry, TableSchema, TableSchemaBuilder};
use crate::sync::{SyncOptions, Synchronizer};
use crate::table::{TableContext, TableDriver};
use crate::values::Item;

/// The backend id used by tables that do not name one.
pub const DEFAULT_BACKEND: &str = "default";

#[derive(Default)]
struct TablesData {
    contexts: HashMap<String, Arc<TableContext>>,
    cache_options: HashMap<String, CacheOptions>,
}

#[derive(Default)]
pub struct DataStore {
    schemas: SchemaRegistry,
    backends: HashMap<String, Arc<dyn Executor>>,
    tables: Mutex<TablesData>,
}

impl DataStore {
    pub fn new() -> DataStore {
        Default::default()
    }

    /// Register a backend executor under an id that table schemas can name.
    pub fn register_backend(&mut self, id: &str, executor: Arc<dyn Executor>) {
        self.backends.insert(id.to_string(), executor);
    }

    /// Register the executor tables without an explicit backend will use.
    pub fn register_default_backend(&mut self, executor: Arc<dyn Executor>) {
        self.register_backend(DEFAULT_BACKEND, executor);
    }

    /// Define a table through the schema builder.
    pub fn define_table(
        &mut self,
        name: &str,
        configure: impl FnOnce(&mut TableSchemaBuilder) -> Result<()>,
    ) -> Result<Arc<TableSchema>> {
        self.schemas.define(name, configure)
    }

    /// Override the query-result cache bounds for one table.  Must run before the table is first used.
    pub fn setup_cache(&self, table: &str, options: CacheOptions) {
        let mut tables = self.lock_tables();
        if tables.contexts.contains_key(table) {
            warn!("{}: cache options set after first use are ignored", table);
            return;
        }
        tables.cache_options.insert(table.to_string(), options);
    }

    /// Validate the schema/backend wiring and connect every backend.
    pub async fn init(&self) -> Result<()> {
        for schema in self.schemas.iter_tables() {
            let id = schema.get_backend().unwrap_or(DEFAULT_BACKEND);
            if !self.backends.contains_key(id) {
                return Err(DatastoreError::UnsupportedBackend {
                    table: schema.get_name().to_string(),
                    backend: id.to_string(),
                });
            }
        }

        for (id, executor) in &self.backends {
            debug!("connecting backend {}", id);
            executor.connect().await?;
        }
        info!("datastore initialized, {} backends", self.backends.len());
        Ok(())
    }

    /// A driver for the named table.
    pub fn table(&self, name: &str) -> Result<TableDriver> {
        let schema = self.schemas.get(name)?;
        let executor = self.backend_for(&schema)?;
        let context = self.context_for(name, &schema);
        Ok(TableDriver::new(context, executor))
    }

    /// A synchronizer reconciling the named table within `scope`.
    pub fn synchronizer(
        &self,
        name: &str,
        scope: Item,
        options: SyncOptions,
    ) -> Result<Synchronizer> {
        Ok(Synchronizer::new(self.table(name)?, scope, options))
    }

    /// Run `body` inside one transaction spanning `tables`.
    ///
    /// All named tables must resolve to the same backend; a transaction cannot span executors.  The transaction
    /// commits if `body` succeeds and rolls back if it fails.
    pub async fn execute_in_transaction<F, Fut, T>(&self, tables: &[&str], body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (first, rest) = match tables.split_first() {
            Some(split) => split,
            None => return Err(DatastoreError::EmptyTransaction),
        };

        let first_id = self.backend_id(first)?;
        for name in rest {
            if self.backend_id(name)? != first_id {
                return Err(DatastoreError::CrossBackendTransaction);
            }
        }
        let executor = self.backend(&first_id)?;

        executor.begin().await?;
        match body().await {
            Ok(value) => {
                executor.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = executor.rollback().await {
                    error!("rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Release caches and close every backend.
    pub async fn close(&self) -> Result<()> {
        {
            let tables = self.lock_tables();
            for context in tables.contexts.values() {
                context.close();
            }
        }
        for executor in self.backends.values() {
            executor.close().await?;
        }
        Ok(())
    }

    /// Whether every registered backend is connected.
    pub fn is_connected(&self) -> bool {
        !self.backends.is_empty() && self.backends.values().all(|e| e.is_connected())
    }

    /// Register a connectivity hook on one backend.
    pub fn on_connect(&self, backend: &str, hook: ConnectHook) -> Result<()> {
        self.backend(backend)?.on_connect(hook);
        Ok(())
    }

    fn lock_tables(&self) -> MutexGuard<'_, TablesData> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn backend(&self, id: &str) -> Result<Arc<dyn Executor>> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| DatastoreError::DriverNotConfigured(id.to_string()))
    }

    fn backend_id(&self, table: &str) -> Result<String> {
        let schema = self.schemas.get(table)?;
        Ok(schema.get_backend().unwrap_or(DEFAULT_BACKEND).to_string())
    }

    fn backend_for(&self, schema: &Arc<TableSchema>) -> Result<Arc<dyn Executor>> {
        self.backend(schema.get_backend().unwrap_or(DEFAULT_BACKEND))
    }

    fn context_for(&self, name: &str, schema: &Arc<TableSchema>) -> Arc<TableContext> {
        let mut tables = self.lock_tables();
        if let Some(context) = tables.contexts.get(name) {
            return context.clone();
        }
        let options = tables.cache_options.get(name).cloned().unwrap_or_default();
        let context = Arc::new(TableContext::new(schema.clone(), options));
        tables.contexts.insert(name.to_string(), context.clone());
        context
    }
}
