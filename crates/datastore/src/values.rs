//! The value processor: conversions between user-facing items and stored rows.
//!
//! Items are JSON maps from column name to value.  An item may be partial: columns absent from the input are simply
//! omitted, never defaulted.  Conversions always go through the column's converters so that callers only ever see
//! user-facing values and statements only ever see stored ones.
use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::driver::FieldsOptions;
use crate::errors::Result;
use crate::schema::TableSchema;

/// A row or partial row: a mapping from column name to value.
pub type Item = serde_json::Map<String, Value>;

/// The resolved field projection for one query.
///
/// `columns` holds the selected column names in schema declaration order.  When no projection was requested the
/// filter is inactive and all columns apply.
#[derive(Debug, Default, Clone)]
pub struct FieldsFilter {
    pub use_column_filter: bool,
    pub columns: Vec<String>,
}

#[derive(Clone)]
pub struct ValueProcessor {
    schema: Arc<TableSchema>,
}

impl ValueProcessor {
    pub fn new(schema: Arc<TableSchema>) -> ValueProcessor {
        ValueProcessor { schema }
    }

    /// Resolve a caller's field projection against the schema.
    ///
    /// Unknown names are dropped rather than failing: the projection controls what comes back, and a name the table
    /// does not have can never come back.
    pub fn massage_fields(&self, fields: Option<&FieldsOptions>) -> FieldsFilter {
        let mut filter = FieldsFilter::default();

        if let Some(fields) = fields {
            let wanted: HashSet<&str> = fields.fields.iter().map(|f| f.as_str()).collect();
            for column in self.schema.iter_columns() {
                if wanted.contains(column.get_name()) {
                    filter.columns.push(column.get_name().to_string());
                }
            }
        }
        filter.use_column_filter = !filter.columns.is_empty();

        filter
    }

    /// Convert the present columns of a partial item to their stored representations.
    ///
    /// Fails with `UnknownColumn` if the item references a column the table does not have.
    pub fn to_stored_target(&self, target: &Item) -> Result<Item> {
        let mut adjusted = Item::new();
        for (name, value) in target {
            let column = self.schema.get_column(name)?;
            adjusted.insert(name.clone(), column.make_stored_value(value.clone()));
        }
        Ok(adjusted)
    }

    /// Convert one stored value for a named column.
    pub fn stored_value(&self, field: &str, value: Value) -> Result<Value> {
        let column = self.schema.get_column(field)?;
        Ok(column.make_stored_value(value))
    }

    /// Convert a stored row back to a user-facing item, restricted to the filtered columns.
    pub fn from_row(&self, row: &Item, filter: &FieldsFilter) -> Item {
        let mut result = Item::new();

        let columns: Vec<&str> = if filter.use_column_filter {
            filter.columns.iter().map(|c| c.as_str()).collect()
        } else {
            self.schema.iter_columns().map(|c| c.get_name()).collect()
        };

        for name in columns {
            let column = match self.schema.try_get_column(name) {
                Some(c) => c,
                None => continue,
            };
            if let Some(value) = row.get(name) {
                result.insert(name.to_string(), column.make_user_value(value.clone()));
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::TableSchemaBuilder;

    fn processor() -> ValueProcessor {
        let mut b = TableSchemaBuilder::new("users").unwrap();
        b.key("projectid").unwrap();
        b.key("name").unwrap();
        b.field("email").unwrap();
        b.field("config").unwrap().complex();
        ValueProcessor::new(Arc::new(b.build().unwrap()))
    }

    fn item(pairs: &[(&str, Value)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn absent_columns_stay_absent() {
        let p = processor();
        let stored = p
            .to_stored_target(&item(&[("email", json!("a@a"))]))
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["email"], json!("a@a"));
    }

    #[test]
    fn complex_columns_are_encoded() {
        let p = processor();
        let stored = p
            .to_stored_target(&item(&[("config", json!({"x": true}))]))
            .unwrap();
        assert_eq!(stored["config"], json!("{\"x\":true}"));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let p = processor();
        assert!(p.to_stored_target(&item(&[("nope", json!(1))])).is_err());
    }

    #[test]
    fn from_row_honors_the_projection() {
        let p = processor();
        let filter = p.massage_fields(Some(&FieldsOptions {
            fields: vec!["email".into(), "bogus".into()],
        }));
        assert!(filter.use_column_filter);
        assert_eq!(filter.columns, ["email"]);

        let row = item(&[("projectid", json!("coke")), ("email", json!("a@a"))]);
        let user = p.from_row(&row, &filter);
        assert_eq!(user.len(), 1);
        assert_eq!(user["email"], json!("a@a"));
    }

    #[test]
    fn from_row_without_projection_converts_everything_present() {
        let p = processor();
        let row = item(&[
            ("projectid", json!("coke")),
            ("config", json!("{\"x\":true}")),
        ]);
        let user = p.from_row(&row, &FieldsFilter::default());
        assert_eq!(user["projectid"], json!("coke"));
        assert_eq!(user["config"], json!({"x": true}));
    }
}
