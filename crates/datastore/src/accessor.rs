//! Typed table accessors.
//!
//! An accessor bundles a table name with its schema definition so an application can declare its tables once, in one
//! place, then prepare them against whichever store it is given.
use std::sync::Arc;

use crate::errors::Result;
use crate::schema::TableSchemaBuilder;
use crate::store::DataStore;
use crate::sync::{SyncOptions, Synchronizer};
use crate::table::TableDriver;
use crate::values::Item;

type Configure = dyn Fn(&mut TableSchemaBuilder) -> Result<()> + Send + Sync;

#[derive(Clone)]
pub struct TableAccessor {
    name: String,
    configure: Arc<Configure>,
}

impl TableAccessor {
    pub fn new(
        name: &str,
        configure: impl Fn(&mut TableSchemaBuilder) -> Result<()> + Send + Sync + 'static,
    ) -> TableAccessor {
        TableAccessor {
            name: name.to_string(),
            configure: Arc::new(configure),
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Register this table's schema with a store.
    pub fn prepare(&self, store: &mut DataStore) -> Result<()> {
        store.define_table(&self.name, |builder| (self.configure)(builder))?;
        Ok(())
    }

    pub fn driver(&self, store: &DataStore) -> Result<TableDriver> {
        store.table(&self.name)
    }

    pub fn synchronizer(
        &self,
        store: &DataStore,
        scope: Item,
        options: SyncOptions,
    ) -> Result<Synchronizer> {
        store.synchronizer(&self.name, scope, options)
    }
}
