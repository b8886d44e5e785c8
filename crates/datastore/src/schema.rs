//! Table schemas.
//!
//! A table is described once at configuration time: a set of named columns, some of which are keys, at most one of
//! which may be auto-generated, and any of which may carry converters between the user-facing value and the stored
//! representation.  Everything the rest of the crate needs (key columns, insertable columns, the field lists for
//! create/delete statements) is derived from the column set and cached on the schema, so the hot paths never have to
//! re-filter columns.
//!
//! Derived projections are rebuilt from scratch after every registration.  The rebuild is idempotent and independent
//! of registration order, as long as all columns are registered before the schema is first used.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::errors::{DatastoreError, Result};
use crate::values::Item;

/// Converts a single value between the user-facing and stored representations.
pub type ValueConverter = Arc<dyn Fn(Value) -> Value + Send + Sync>;

lazy_static! {
    static ref IDENT_RE: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

fn check_identifier(name: &str) -> Result<()> {
    if !IDENT_RE.is_match(name) {
        return Err(DatastoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

/// A column in a table.
pub struct Column {
    name: String,
    is_key: bool,
    is_auto_generated: bool,
    is_complex: bool,
    is_settable: bool,
    to_stored: Option<ValueConverter>,
    from_stored: Option<ValueConverter>,
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("is_key", &self.is_key)
            .field("is_auto_generated", &self.is_auto_generated)
            .field("is_complex", &self.is_complex)
            .field("is_settable", &self.is_settable)
            .finish()
    }
}

impl Column {
    fn new(name: String, is_key: bool) -> Column {
        Column {
            name,
            is_key,
            is_auto_generated: false,
            is_complex: false,
            // Key columns are matched on, never assigned to, so registering a key disables settability.
            is_settable: !is_key,
            to_stored: None,
            from_stored: None,
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn is_auto_generated(&self) -> bool {
        self.is_auto_generated
    }

    pub fn is_complex(&self) -> bool {
        self.is_complex
    }

    pub fn is_settable(&self) -> bool {
        self.is_settable
    }

    pub fn has_from_stored(&self) -> bool {
        self.from_stored.is_some() || self.is_complex
    }

    /// Mark this column as auto-generated by the backend (e.g. an autoincrement rowid).
    pub fn auto_generated(&mut self) -> &mut Column {
        self.is_auto_generated = true;
        self.is_settable = false;
        self
    }

    /// Mark this column as holding a structured (JSON-like) value.
    ///
    /// Complex columns default to JSON-text encoding in both directions and are filtered with an explicit cast
    /// rather than plain equality.
    pub fn complex(&mut self) -> &mut Column {
        self.is_complex = true;
        self
    }

    /// Install a converter applied to user values before they are bound to statements.
    pub fn to_stored(&mut self, cb: impl Fn(Value) -> Value + Send + Sync + 'static) -> &mut Column {
        self.to_stored = Some(Arc::new(cb));
        self
    }

    /// Install a converter applied to stored values before rows are returned to the caller.
    pub fn from_stored(
        &mut self,
        cb: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> &mut Column {
        self.from_stored = Some(Arc::new(cb));
        self
    }

    /// Convert a user-facing value to its stored representation.
    pub fn make_stored_value(&self, value: Value) -> Value {
        if let Some(cb) = &self.to_stored {
            return cb(value);
        }
        if self.is_complex {
            return Value::String(value.to_string());
        }
        value
    }

    /// Convert a stored value back to its user-facing representation.
    pub fn make_user_value(&self, value: Value) -> Value {
        if let Some(cb) = &self.from_stored {
            return cb(value);
        }
        if self.is_complex {
            if let Value::String(text) = &value {
                if let Ok(parsed) = serde_json::from_str(text) {
                    return parsed;
                }
            }
        }
        value
    }
}

/// Description of a table: the ordered column set plus the cached derived projections.
#[derive(Debug)]
pub struct TableSchema {
    name: String,
    backend: Option<String>,
    driver_params: Item,
    columns: Vec<Column>,

    key_fields: Vec<String>,
    query_fields: Vec<String>,
    create_fields: Vec<String>,
    delete_fields: Vec<String>,
}

impl TableSchema {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// The backend identifier this table is bound to, if any.
    pub fn get_backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn get_driver_params(&self) -> &Item {
        &self.driver_params
    }

    pub fn iter_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    pub fn get_column(&self, name: &str) -> Result<&Column> {
        self.try_get_column(name)
            .ok_or_else(|| DatastoreError::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    pub fn try_get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_key)
    }

    pub fn non_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_key)
    }

    /// The columns an insert statement assigns: everything not generated by the backend.
    pub fn insert_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_auto_generated)
    }

    /// The auto-generated key column, if the table has one.  There is never more than one.
    pub fn auto_generated_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_key && c.is_auto_generated)
    }

    pub fn get_key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Keys first, then the remaining columns; the default projection for reads.
    pub fn get_query_fields(&self) -> &[String] {
        &self.query_fields
    }

    /// The settable columns, i.e. those a caller may assign values to.
    pub fn get_create_fields(&self) -> &[String] {
        &self.create_fields
    }

    /// Key columns only; what a delete statement matches on.
    pub fn get_delete_fields(&self) -> &[String] {
        &self.delete_fields
    }

    fn rebuild_projections(&mut self) {
        self.key_fields = self
            .columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.clone())
            .collect();
        self.query_fields = self
            .columns
            .iter()
            .filter(|c| c.is_key)
            .chain(self.columns.iter().filter(|c| !c.is_key))
            .map(|c| c.name.clone())
            .collect();
        self.create_fields = self
            .columns
            .iter()
            .filter(|c| c.is_settable)
            .map(|c| c.name.clone())
            .collect();
        self.delete_fields = self.key_fields.clone();
    }
}

/// A helper to build table schemas.
pub struct TableSchemaBuilder {
    schema: TableSchema,
}

impl TableSchemaBuilder {
    pub fn new(name: &str) -> Result<TableSchemaBuilder> {
        check_identifier(name)?;
        Ok(TableSchemaBuilder {
            schema: TableSchema {
                name: name.to_string(),
                backend: None,
                driver_params: Item::new(),
                columns: vec![],
                key_fields: vec![],
                query_fields: vec![],
                create_fields: vec![],
                delete_fields: vec![],
            },
        })
    }

    /// Bind this table to a backend identifier registered with the store.
    pub fn backend(&mut self, id: &str) -> &mut TableSchemaBuilder {
        self.schema.backend = Some(id.to_string());
        self
    }

    /// Opaque parameters passed through to the backend (e.g. a database name or file path).
    pub fn driver_params(&mut self, params: Item) -> &mut TableSchemaBuilder {
        self.schema.driver_params = params;
        self
    }

    fn add_column(&mut self, name: &str, is_key: bool) -> Result<&mut Column> {
        check_identifier(name)?;
        if self.schema.columns.iter().any(|c| c.name == name) {
            return Err(DatastoreError::DuplicateColumn {
                table: self.schema.name.clone(),
                column: name.to_string(),
            });
        }
        self.schema.columns.push(Column::new(name.to_string(), is_key));
        self.schema.rebuild_projections();
        let last = self.schema.columns.len() - 1;
        Ok(&mut self.schema.columns[last])
    }

    /// Register a key column.
    pub fn key(&mut self, name: &str) -> Result<&mut Column> {
        self.add_column(name, true)
    }

    /// Register a non-key column.
    pub fn field(&mut self, name: &str) -> Result<&mut Column> {
        self.add_column(name, false)
    }

    pub fn build(mut self) -> Result<TableSchema> {
        let mut auto_key: Option<&Column> = None;
        for column in &self.schema.columns {
            if !column.is_auto_generated {
                continue;
            }
            if !column.is_key {
                return Err(DatastoreError::AutoGeneratedNonKey {
                    table: self.schema.name.clone(),
                    column: column.name.clone(),
                });
            }
            if auto_key.is_some() {
                return Err(DatastoreError::DuplicateAutoGeneratedKey {
                    table: self.schema.name.clone(),
                    column: column.name.clone(),
                });
            }
            auto_key = Some(column);
        }

        // Column flags may have been toggled after registration; one final rebuild picks those up.
        self.schema.rebuild_projections();
        Ok(self.schema)
    }
}

/// The registry of table schemas, keyed by table name.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: HashMap<String, Arc<TableSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> SchemaRegistry {
        Default::default()
    }

    /// Define a table through the builder callback and register it.
    pub fn define(
        &mut self,
        name: &str,
        configure: impl FnOnce(&mut TableSchemaBuilder) -> Result<()>,
    ) -> Result<Arc<TableSchema>> {
        let mut builder = TableSchemaBuilder::new(name)?;
        configure(&mut builder)?;
        let schema = Arc::new(builder.build()?);
        self.tables.insert(name.to_string(), schema.clone());
        Ok(schema)
    }

    pub fn get(&self, name: &str) -> Result<Arc<TableSchema>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| DatastoreError::UnknownTable(name.to_string()))
    }

    pub fn iter_tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.values()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn users_schema() -> TableSchema {
        let mut b = TableSchemaBuilder::new("users").unwrap();
        b.key("projectid").unwrap();
        b.key("name").unwrap();
        b.field("email").unwrap();
        b.build().unwrap()
    }

    #[test]
    fn projections_are_derived() {
        let schema = users_schema();
        assert_eq!(schema.get_key_fields(), ["projectid", "name"]);
        assert_eq!(schema.get_query_fields(), ["projectid", "name", "email"]);
        assert_eq!(schema.get_create_fields(), ["email"]);
        assert_eq!(schema.get_delete_fields(), ["projectid", "name"]);
    }

    #[test]
    fn projections_ignore_registration_order() {
        let mut b = TableSchemaBuilder::new("users").unwrap();
        b.field("email").unwrap();
        b.key("projectid").unwrap();
        b.key("name").unwrap();
        let schema = b.build().unwrap();
        // Keys always come first in the query projection regardless of registration order.
        assert_eq!(schema.get_query_fields(), ["projectid", "name", "email"]);
    }

    #[test]
    fn keys_are_not_settable() {
        let schema = users_schema();
        assert!(!schema.get_column("projectid").unwrap().is_settable());
        assert!(schema.get_column("email").unwrap().is_settable());
    }

    #[test]
    fn second_auto_generated_key_fails() {
        let mut b = TableSchemaBuilder::new("t").unwrap();
        b.key("a").unwrap().auto_generated();
        b.key("b").unwrap().auto_generated();
        assert!(matches!(
            b.build(),
            Err(DatastoreError::DuplicateAutoGeneratedKey { .. })
        ));
    }

    #[test]
    fn auto_generated_field_fails() {
        let mut b = TableSchemaBuilder::new("t").unwrap();
        b.field("a").unwrap().auto_generated();
        assert!(matches!(
            b.build(),
            Err(DatastoreError::AutoGeneratedNonKey { .. })
        ));
    }

    #[test]
    fn duplicate_column_fails() {
        let mut b = TableSchemaBuilder::new("t").unwrap();
        b.key("a").unwrap();
        assert!(matches!(
            b.field("a"),
            Err(DatastoreError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn bad_identifiers_fail() {
        assert!(TableSchemaBuilder::new("users; drop table users").is_err());
        let mut b = TableSchemaBuilder::new("t").unwrap();
        assert!(b.field("not a column").is_err());
    }

    #[test]
    fn unknown_column_fails() {
        let schema = users_schema();
        assert!(matches!(
            schema.get_column("nope"),
            Err(DatastoreError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn complex_columns_default_to_json_text() {
        let mut b = TableSchemaBuilder::new("t").unwrap();
        b.key("id").unwrap();
        b.field("config").unwrap().complex();
        let schema = b.build().unwrap();
        let column = schema.get_column("config").unwrap();

        let stored = column.make_stored_value(json!({"a": 1}));
        assert_eq!(stored, json!("{\"a\":1}"));
        assert_eq!(column.make_user_value(stored), json!({"a": 1}));
    }

    #[test]
    fn converters_override_defaults() {
        let mut b = TableSchemaBuilder::new("t").unwrap();
        b.key("id").unwrap();
        b.field("flag")
            .unwrap()
            .to_stored(|v| json!(if v == json!(true) { 1 } else { 0 }))
            .from_stored(|v| json!(v == json!(1)));
        let schema = b.build().unwrap();
        let column = schema.get_column("flag").unwrap();

        assert_eq!(column.make_stored_value(json!(true)), json!(1));
        assert_eq!(column.make_user_value(json!(1)), json!(true));
    }
}
