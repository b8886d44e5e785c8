//! SQL text generation and the statement-shape cache.
//!
//! A statement's identity is its shape: the ordered list of column names in each clause.  Shapes repeat constantly
//! (the same filter columns, the same projection), so the generated SQL is memoized under a deterministic name and
//! repeat calls skip generation entirely.  Queries with ad hoc comparison filters, an explicit ordering or a row
//! limit have an unbounded shape and are compiled fresh on every call, never memoized.
//!
//! The fixed-shape insert and update statements go through tera one-off templates; the dynamic shapes are assembled
//! directly.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use itertools::Itertools;
use log::*;

use crate::driver::{FilterOptions, OrderOptions};
use crate::errors::{DatastoreError, Result};
use crate::schema::{Column, TableSchema};

const INSERT_TEMPLATE: &str = "INSERT OR IGNORE INTO `{{ table }}` (\
{% for c in columns %}`{{ c }}`{% if not loop.last %}, {% endif %}{% endfor %}\
) VALUES (\
{% for c in columns %}?{% if not loop.last %}, {% endif %}{% endfor %});";

const UPDATE_TEMPLATE: &str = "UPDATE `{{ table }}` SET \
{% for c in columns %}`{{ c }}` = ?{% if not loop.last %}, {% endif %}{% endfor %}\
{{ where_clause }};";

/// Comparison operators allowed in ad hoc field filters.
const OPERATORS: &[&str] = &["=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE"];

/// Builds and memoizes the SQL statements of one table.
pub struct StatementStore {
    schema: Arc<TableSchema>,
    statements: Mutex<HashMap<String, Arc<str>>>,
}

impl StatementStore {
    pub fn new(schema: Arc<TableSchema>) -> StatementStore {
        StatementStore {
            schema,
            statements: Mutex::new(HashMap::new()),
        }
    }

    /// The columns an update statement assigns, in schema order.
    pub fn updateable_columns(&self) -> Vec<&Column> {
        self.schema.non_key_columns().collect()
    }

    /// The columns an update statement filters on: the keys.
    pub fn update_filter_columns(&self) -> Vec<&Column> {
        self.schema.key_columns().collect()
    }

    /// The duplicate-ignoring insert statement.
    pub fn insert_statement(&self) -> Result<Arc<str>> {
        self.get_or_register("DS_INSERT", || {
            let mut context = tera::Context::new();
            context.insert("table", self.schema.get_name());
            context.insert(
                "columns",
                &self
                    .schema
                    .insert_columns()
                    .map(|c| c.get_name())
                    .collect::<Vec<_>>(),
            );
            Ok(tera::Tera::one_off(INSERT_TEMPLATE, &context, false)?)
        })
    }

    /// The update-by-key statement.  Fails with `NotUpdatable` if the table has no non-key columns.
    pub fn update_statement(&self) -> Result<Arc<str>> {
        let updateable = self.updateable_columns();
        if updateable.is_empty() {
            return Err(DatastoreError::NotUpdatable(
                self.schema.get_name().to_string(),
            ));
        }

        self.get_or_register("DS_UPDATE", || {
            let mut context = tera::Context::new();
            context.insert("table", self.schema.get_name());
            context.insert(
                "columns",
                &updateable.iter().map(|c| c.get_name()).collect::<Vec<_>>(),
            );
            context.insert(
                "where_clause",
                &columns_filter_sql(&self.update_filter_columns()),
            );
            Ok(tera::Tera::one_off(UPDATE_TEMPLATE, &context, false)?)
        })
    }

    /// A delete statement filtered by the given columns; memoized by the filter column set.
    pub fn delete_statement(&self, filter_columns: &[&Column]) -> Result<Arc<str>> {
        let name = statement_name("DELETE", filter_columns);
        self.get_or_register(&name, || {
            Ok(format!(
                "DELETE FROM `{}`{};",
                self.schema.get_name(),
                columns_filter_sql(filter_columns)
            ))
        })
    }

    /// A fixed-shape select; memoized by filter columns and projection.
    ///
    /// `select_columns` of `None` selects every column of the table.
    pub fn select_statement(
        &self,
        filter_columns: &[&Column],
        select_columns: Option<&[&Column]>,
    ) -> Result<Arc<str>> {
        let name = query_statement_name(filter_columns, select_columns);
        self.get_or_register(&name, || {
            self.select_sql(filter_columns, select_columns, None, None, false)
        })
    }

    /// Build select SQL for an unbounded shape: ad hoc filters, ordering, a row limit.  Never memoized.
    ///
    /// Ad hoc filter values and the limit bind as parameters, in that order, after the filter-column values.
    pub fn select_sql(
        &self,
        filter_columns: &[&Column],
        select_columns: Option<&[&Column]>,
        field_filters: Option<&FilterOptions>,
        order: Option<&OrderOptions>,
        has_limit: bool,
    ) -> Result<String> {
        let all_columns: Vec<&Column>;
        let selected = match select_columns {
            Some(columns) => columns,
            None => {
                all_columns = self.schema.iter_columns().collect();
                &all_columns[..]
            }
        };

        let mut sql = String::from("SELECT ");
        sql += &selected.iter().map(|c| format!("`{}`", c.get_name())).join(", ");
        sql += &format!(" FROM `{}`", self.schema.get_name());

        let mut criteria: Vec<String> = filter_columns.iter().map(|c| column_filter_sql(c)).collect();

        if let Some(filters) = field_filters {
            for filter in &filters.fields {
                let column = self.schema.get_column(&filter.name)?;
                let operator = OPERATORS
                    .iter()
                    .find(|op| op.eq_ignore_ascii_case(&filter.operator))
                    .ok_or_else(|| DatastoreError::InvalidOperator(filter.operator.clone()))?;
                criteria.push(format!("(`{}` {} ?)", column.get_name(), operator));
            }
        }

        if !criteria.is_empty() {
            sql += " WHERE ";
            sql += &criteria.join(" AND ");
        }

        if let Some(order) = order {
            if !order.fields.is_empty() {
                let mut terms = vec![];
                for field in &order.fields {
                    let column = self.schema.get_column(&field.name)?;
                    terms.push(format!(
                        "`{}` {}",
                        column.get_name(),
                        if field.asc { "ASC" } else { "DESC" }
                    ));
                }
                sql += " ORDER BY ";
                sql += &terms.join(", ");
            }
        }

        if has_limit {
            sql += " LIMIT ?";
        }

        sql.push(';');
        Ok(sql)
    }

    /// A group-by statement; memoized by filter columns, group columns and aggregation expressions.
    ///
    /// Aggregation expressions are trusted SQL fragments (e.g. `COUNT(*) as count`) supplied by the application,
    /// never by end users.
    pub fn group_statement(
        &self,
        filter_columns: &[&Column],
        group_columns: &[&Column],
        aggregations: &[&str],
    ) -> Result<Arc<str>> {
        let name = group_statement_name(filter_columns, group_columns, aggregations);
        self.get_or_register(&name, || {
            let select_fields = group_columns
                .iter()
                .map(|c| format!("`{}`", c.get_name()))
                .chain(aggregations.iter().map(|a| a.to_string()))
                .join(", ");

            Ok(format!(
                "SELECT {} FROM `{}`{} GROUP BY {};",
                select_fields,
                self.schema.get_name(),
                columns_filter_sql(filter_columns),
                group_columns
                    .iter()
                    .map(|c| format!("`{}`", c.get_name()))
                    .join(", ")
            ))
        })
    }

    /// A row-count statement; memoized by the filter column set.
    pub fn count_statement(&self, filter_columns: &[&Column]) -> Result<Arc<str>> {
        let name = statement_name("COUNT", filter_columns);
        self.get_or_register(&name, || {
            Ok(format!(
                "SELECT COUNT(*) as count FROM `{}`{};",
                self.schema.get_name(),
                columns_filter_sql(filter_columns)
            ))
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<str>>> {
        self.statements.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_or_register(&self, name: &str, build: impl FnOnce() -> Result<String>) -> Result<Arc<str>> {
        if let Some(sql) = self.lock().get(name) {
            return Ok(sql.clone());
        }

        let sql: Arc<str> = build()?.into();
        debug!(
            "{}: registering statement {} => {}",
            self.schema.get_name(),
            name,
            sql
        );
        self.lock().insert(name.to_string(), sql.clone());
        Ok(sql)
    }
}

/// One equality criterion.  Complex columns compare through an explicit cast, not plain equality.
fn column_filter_sql(column: &Column) -> String {
    if column.is_complex() {
        format!("(`{}` = CAST(? AS TEXT))", column.get_name())
    } else {
        format!("(`{}` = ?)", column.get_name())
    }
}

fn columns_filter_sql(columns: &[&Column]) -> String {
    if columns.is_empty() {
        return String::new();
    }
    format!(
        " WHERE {}",
        columns.iter().map(|c| column_filter_sql(c)).join(" AND ")
    )
}

fn statement_name(kind: &str, columns: &[&Column]) -> String {
    if columns.is_empty() {
        format!("DS_{}_ALL", kind)
    } else {
        format!(
            "DS_{}_WHERE_{}",
            kind,
            columns.iter().map(|c| c.get_name()).join("_")
        )
    }
}

fn query_statement_name(filter_columns: &[&Column], select_columns: Option<&[&Column]>) -> String {
    let mut name = statement_name("SELECT", filter_columns);
    match select_columns {
        None => name += "_ALL",
        Some(columns) => {
            name += "_SELECT_";
            name += &columns.iter().map(|c| c.get_name()).join("_");
        }
    }
    name
}

fn group_statement_name(
    filter_columns: &[&Column],
    group_columns: &[&Column],
    aggregations: &[&str],
) -> String {
    let mut name = statement_name("GROUP", filter_columns);
    if group_columns.is_empty() {
        name += "_GRALL";
    } else {
        name += "_GROUP_";
        name += &group_columns.iter().map(|c| c.get_name()).join("_");
    }
    if !aggregations.is_empty() {
        name += "_AGGR_";
        name += &aggregations.iter().join("_");
    }
    name
}
