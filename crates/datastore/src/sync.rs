//! Declarative table synchronization.
//!
//! A synchronizer owns a scope (an equality target selecting the rows it is responsible for) and reconciles that
//! scope against a desired item list: rows present but not desired are deleted, items desired but not present are
//! created.  Identity is a content hash over the non-generated columns, so an item that changed in any field counts
//! as a delete of the old row plus a create of the new one.
//!
//! Deletes run before creates so a changed row never collides with its own old key state.  Deletes match on key
//! columns only.  Creates go through the upsert path, which absorbs races with concurrent writers.
use std::collections::BTreeMap;

use log::*;

use crate::driver::{FieldsOptions, QueryOptions};
use crate::errors::Result;
use crate::hash::content_hash;
use crate::table::TableDriver;
use crate::values::Item;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Leave undesired rows in place instead of deleting them.
    pub skip_delete: bool,
}

/// One executed reconciliation step.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaAction {
    Create(Item),
    Delete(Item),
}

pub struct Synchronizer {
    driver: TableDriver,
    scope: Item,
    options: SyncOptions,
}

impl Synchronizer {
    pub fn new(driver: TableDriver, scope: Item, options: SyncOptions) -> Synchronizer {
        Synchronizer {
            driver,
            scope,
            options,
        }
    }

    /// Reconcile the scope against `items` and return the executed delta, deletes first.
    ///
    /// Steps apply serially and the first failure aborts the pass; steps already executed stay executed.  A second
    /// run with the same items yields an empty delta.
    pub async fn execute(&self, items: &[Item]) -> Result<Vec<DeltaAction>> {
        // Hashes compare the non-generated columns only, but the fetch also carries the key columns so a delete can
        // address rows whose key the backend generated.
        let compare_fields: Vec<String> = self
            .driver
            .schema()
            .insert_columns()
            .map(|c| c.get_name().to_string())
            .collect();
        let mut fetch_fields = compare_fields.clone();
        for key in self.driver.schema().get_key_fields() {
            if !fetch_fields.contains(key) {
                fetch_fields.push(key.clone());
            }
        }

        let mut query_options = QueryOptions::default();
        query_options.skip_cache = true;
        query_options.fields = Some(FieldsOptions {
            fields: fetch_fields,
        });
        let current_rows = self.driver.query_many(&self.scope, &query_options).await?;

        // Hash maps keyed by content; BTreeMap keeps the apply order deterministic.  Duplicate items collapse here.
        let mut current: BTreeMap<String, Item> = BTreeMap::new();
        for row in &current_rows {
            let projected = project(row, &compare_fields);
            current.insert(content_hash(&projected), row.clone());
        }

        let mut target: BTreeMap<String, Item> = BTreeMap::new();
        for item in items {
            let mut merged = self.scope.clone();
            for (name, value) in item {
                merged.insert(name.clone(), value.clone());
            }
            let projected = project(&merged, &compare_fields);
            target.insert(content_hash(&projected), projected);
        }

        debug!(
            "{}: sync pass, {} current, {} target",
            self.driver.schema().get_name(),
            current.len(),
            target.len()
        );

        let mut actions = vec![];

        if !self.options.skip_delete {
            for (hash, row) in &current {
                if !target.contains_key(hash) {
                    self.driver.delete(row).await?;
                    actions.push(DeltaAction::Delete(row.clone()));
                }
            }
        }

        for (hash, item) in &target {
            if !current.contains_key(hash) {
                let created = self
                    .driver
                    .create(item)
                    .await?
                    .unwrap_or_else(|| item.clone());
                actions.push(DeltaAction::Create(created));
            }
        }

        info!(
            "{}: sync applied {} actions",
            self.driver.schema().get_name(),
            actions.len()
        );
        Ok(actions)
    }
}

/// Restrict an item to the named fields.  Absent fields stay absent; they are not nulled in.
fn project(item: &Item, fields: &[String]) -> Item {
    let mut out = Item::new();
    for field in fields {
        if let Some(value) = item.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}
