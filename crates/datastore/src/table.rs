//! The table driver: typed CRUD over one table.
//!
//! A driver is cheap to construct; the expensive shared state (the statement store and the query-result cache) lives
//! in a [`TableContext`] owned by the store, so statement memoization and cached results survive across drivers.
//!
//! All values route through the value processor in both directions.  Reads with a fixed shape go through the query
//! cache; reads carrying ad hoc filters, an ordering or a row limit bypass it, as does `skip_cache`.  Writes do not
//! invalidate: staleness is bounded by the cache's age limit.
use std::sync::Arc;

use log::*;
use serde_json::{json, Value};

use crate::cache::{CacheOptions, QueryCache};
use crate::driver::{Executor, QueryOptions};
use crate::errors::Result;
use crate::schema::{Column, TableSchema};
use crate::statements::StatementStore;
use crate::values::{FieldsFilter, Item, ValueProcessor};

/// The shared per-table state: schema, memoized statements, query-result cache.
pub struct TableContext {
    pub(crate) schema: Arc<TableSchema>,
    pub(crate) statements: StatementStore,
    pub(crate) cache: QueryCache<Vec<Item>>,
}

impl TableContext {
    pub fn new(schema: Arc<TableSchema>, cache_options: CacheOptions) -> TableContext {
        TableContext {
            statements: StatementStore::new(schema.clone()),
            cache: QueryCache::new(cache_options),
            schema,
        }
    }

    pub fn close(&self) {
        self.cache.close();
    }
}

pub struct TableDriver {
    context: Arc<TableContext>,
    executor: Arc<dyn Executor>,
    processor: ValueProcessor,
}

impl TableDriver {
    pub fn new(context: Arc<TableContext>, executor: Arc<dyn Executor>) -> TableDriver {
        let processor = ValueProcessor::new(context.schema.clone());
        TableDriver {
            context,
            executor,
            processor,
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.context.schema
    }

    /// The schema columns present in a stored target, in schema order.  This order also fixes the parameter order.
    fn present_columns<'a>(&'a self, stored: &Item) -> Vec<&'a Column> {
        self.context
            .schema
            .iter_columns()
            .filter(|c| stored.contains_key(c.get_name()))
            .collect()
    }

    fn bind(stored: &Item, columns: &[&Column]) -> Vec<Value> {
        columns
            .iter()
            .map(|c| stored.get(c.get_name()).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Query all rows matching the equality target, subject to `options`.
    pub async fn query_many(&self, target: &Item, options: &QueryOptions) -> Result<Vec<Item>> {
        let fields_filter = self.processor.massage_fields(options.fields.as_ref());
        let stored = self.processor.to_stored_target(target)?;
        let filter_columns = self.present_columns(&stored);
        let mut params = Self::bind(&stored, &filter_columns);

        let select_columns: Option<Vec<&Column>> = if fields_filter.use_column_filter {
            let mut columns = vec![];
            for name in &fields_filter.columns {
                columns.push(self.context.schema.get_column(name)?);
            }
            Some(columns)
        } else {
            None
        };

        let has_filters = options
            .filters
            .as_ref()
            .map(|f| !f.fields.is_empty())
            .unwrap_or(false);
        let has_order = options
            .order
            .as_ref()
            .map(|o| !o.fields.is_empty())
            .unwrap_or(false);
        let has_limit = options.limit_count.is_some();

        // Unbounded shapes are compiled fresh and never cached; a cache keyed on them would never repeat.
        if has_filters || has_order || has_limit {
            let sql = self.context.statements.select_sql(
                &filter_columns,
                select_columns.as_deref(),
                options.filters.as_ref(),
                options.order.as_ref(),
                has_limit,
            )?;
            if let Some(filters) = &options.filters {
                for filter in &filters.fields {
                    params.push(
                        self.processor
                            .stored_value(&filter.name, filter.value.clone())?,
                    );
                }
            }
            if let Some(limit) = options.limit_count {
                params.push(json!(limit));
            }
            let rows = self.executor.execute(&sql, params).await?.into_rows()?;
            return Ok(rows
                .iter()
                .map(|r| self.processor.from_row(r, &fields_filter))
                .collect());
        }

        let sql = self
            .context
            .statements
            .select_statement(&filter_columns, select_columns.as_deref())?;

        if options.skip_cache {
            let rows = self.executor.execute(&sql, params).await?.into_rows()?;
            return Ok(rows
                .iter()
                .map(|r| self.processor.from_row(r, &fields_filter))
                .collect());
        }

        let key = cache_key(&filter_columns, &params, &fields_filter);
        self.context
            .cache
            .dynamic_get(&key, || async move {
                let rows = self.executor.execute(&sql, params).await?.into_rows()?;
                Ok(rows
                    .iter()
                    .map(|r| self.processor.from_row(r, &fields_filter))
                    .collect())
            })
            .await
    }

    /// The first row matching the target, if any.
    pub async fn query_one(&self, target: &Item, options: &QueryOptions) -> Result<Option<Item>> {
        Ok(self.query_many(target, options).await?.into_iter().next())
    }

    /// Group-by over the matching rows.
    ///
    /// Aggregation expressions are trusted SQL fragments supplied by the application.  Aggregate output columns pass
    /// through unconverted since the schema does not know them.
    pub async fn query_group(
        &self,
        target: &Item,
        group_fields: &[&str],
        aggregations: &[&str],
    ) -> Result<Vec<Item>> {
        let stored = self.processor.to_stored_target(target)?;
        let filter_columns = self.present_columns(&stored);
        let group_columns = group_fields
            .iter()
            .map(|n| self.context.schema.get_column(n))
            .collect::<Result<Vec<_>>>()?;

        let sql =
            self.context
                .statements
                .group_statement(&filter_columns, &group_columns, aggregations)?;
        let params = Self::bind(&stored, &filter_columns);
        let rows = self.executor.execute(&sql, params).await?.into_rows()?;
        Ok(rows.into_iter().map(|r| self.user_facing_row(r)).collect())
    }

    /// Count the rows matching the target.
    pub async fn query_count(&self, target: &Item) -> Result<u64> {
        let stored = self.processor.to_stored_target(target)?;
        let filter_columns = self.present_columns(&stored);
        let sql = self.context.statements.count_statement(&filter_columns)?;
        let params = Self::bind(&stored, &filter_columns);
        let rows = self.executor.execute(&sql, params).await?.into_rows()?;
        Ok(rows
            .first()
            .and_then(|r| r.get("count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    /// Insert a new row, ignoring duplicate-key conflicts.
    ///
    /// Returns `None` when the row already existed.  On success the returned item carries the generated key when the
    /// table has one.
    pub async fn create_new(&self, item: &Item) -> Result<Option<Item>> {
        let stored = self.processor.to_stored_target(item)?;
        let sql = self.context.statements.insert_statement()?;
        let params: Vec<Value> = self
            .context
            .schema
            .insert_columns()
            .map(|c| stored.get(c.get_name()).cloned().unwrap_or(Value::Null))
            .collect();

        let (affected, insert_id) = self.executor.execute(&sql, params).await?.into_write()?;
        if affected == 0 {
            debug!(
                "{}: create_new hit an existing row",
                self.context.schema.get_name()
            );
            return Ok(None);
        }

        let mut result = item.clone();
        if let (Some(column), Some(id)) = (self.context.schema.auto_generated_key(), insert_id) {
            result.insert(column.get_name().to_string(), Value::Number(id.into()));
        }
        Ok(Some(result))
    }

    /// Update the non-key columns of the row addressed by the item's keys.
    ///
    /// Columns absent from the item are set to null, not left alone.  Returns `None` when no row matched the keys.
    pub async fn update_existing(&self, item: &Item) -> Result<Option<Item>> {
        let stored = self.processor.to_stored_target(item)?;
        let sql = self.context.statements.update_statement()?;

        let assigned = self.context.statements.updateable_columns();
        let filtered = self.context.statements.update_filter_columns();
        let mut params = Self::bind(&stored, &assigned);
        params.extend(Self::bind(&stored, &filtered));

        let (affected, _) = self.executor.execute(&sql, params).await?.into_write()?;
        if affected == 0 {
            debug!(
                "{}: update_existing matched no row",
                self.context.schema.get_name()
            );
            return Ok(None);
        }
        Ok(Some(item.clone()))
    }

    /// Upsert: insert the row, or update the existing one on a duplicate key.
    ///
    /// `None` only if the conflicting row vanished between the insert and the update.
    pub async fn create(&self, item: &Item) -> Result<Option<Item>> {
        if let Some(created) = self.create_new(item).await? {
            return Ok(Some(created));
        }
        self.update_existing(item).await
    }

    /// Delete the row addressed by the item's key columns.  Returns the number of rows removed.
    ///
    /// Non-key columns in the target are ignored; a missing key binds null and matches nothing.
    pub async fn delete(&self, target: &Item) -> Result<u64> {
        let stored = self.processor.to_stored_target(target)?;
        let key_columns: Vec<&Column> = self.context.schema.key_columns().collect();
        let sql = self.context.statements.delete_statement(&key_columns)?;
        let params = Self::bind(&stored, &key_columns);
        Ok(self.executor.execute(&sql, params).await?.into_write()?.0)
    }

    /// Delete every row matching the columns present in the target, key or not.
    ///
    /// An empty target clears the whole table.
    pub async fn delete_many(&self, target: &Item) -> Result<u64> {
        let stored = self.processor.to_stored_target(target)?;
        let filter_columns = self.present_columns(&stored);
        let sql = self.context.statements.delete_statement(&filter_columns)?;
        let params = Self::bind(&stored, &filter_columns);
        Ok(self.executor.execute(&sql, params).await?.into_write()?.0)
    }

    fn user_facing_row(&self, row: Item) -> Item {
        row.into_iter()
            .map(|(name, value)| {
                let value = match self.context.schema.try_get_column(&name) {
                    Some(column) => column.make_user_value(value),
                    None => value,
                };
                (name, value)
            })
            .collect()
    }
}

fn cache_key(filter_columns: &[&Column], values: &[Value], fields: &FieldsFilter) -> String {
    json!({
        "columns": filter_columns.iter().map(|c| c.get_name()).collect::<Vec<_>>(),
        "values": values,
        "fields": fields.columns,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::driver::FieldsOptions;
    use crate::schema::TableSchemaBuilder;
    use crate::sqlite::{SqliteConfig, SqliteExecutor};

    fn item(pairs: &[(&str, Value)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn users_driver() -> TableDriver {
        let executor = Arc::new(SqliteExecutor::new(SqliteConfig::in_memory()));
        executor.connect().await.unwrap();
        executor
            .execute(
                "CREATE TABLE users (
                    projectid TEXT, name TEXT, email TEXT, config TEXT,
                    PRIMARY KEY (projectid, name)
                );",
                vec![],
            )
            .await
            .unwrap();

        let mut b = TableSchemaBuilder::new("users").unwrap();
        b.key("projectid").unwrap();
        b.key("name").unwrap();
        b.field("email").unwrap();
        b.field("config").unwrap().complex();
        let context = Arc::new(TableContext::new(
            Arc::new(b.build().unwrap()),
            CacheOptions::default(),
        ));
        TableDriver::new(context, executor)
    }

    #[tokio::test]
    async fn create_and_query_round_trip() {
        let driver = users_driver().await;
        let user = item(&[
            ("projectid", json!("coke")),
            ("name", json!("alice")),
            ("email", json!("alice@coke")),
            ("config", json!({"admin": true})),
        ]);
        driver.create(&user).await.unwrap();

        let found = driver
            .query_one(
                &item(&[("projectid", json!("coke")), ("name", json!("alice"))]),
                &QueryOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["email"], json!("alice@coke"));
        assert_eq!(found["config"], json!({"admin": true}));
    }

    #[tokio::test]
    async fn create_new_on_duplicate_is_none() {
        let driver = users_driver().await;
        let user = item(&[("projectid", json!("coke")), ("name", json!("alice"))]);
        assert!(driver.create_new(&user).await.unwrap().is_some());
        assert!(driver.create_new(&user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_on_existing_key_updates() {
        let driver = users_driver().await;
        let keys = item(&[("projectid", json!("coke")), ("name", json!("alice"))]);

        let mut first = keys.clone();
        first.insert("email".into(), json!("old@coke"));
        driver.create(&first).await.unwrap();

        let mut second = keys.clone();
        second.insert("email".into(), json!("new@coke"));
        assert!(driver.create(&second).await.unwrap().is_some());

        let mut options = QueryOptions::default();
        options.skip_cache = true;
        let found = driver.query_one(&keys, &options).await.unwrap().unwrap();
        assert_eq!(found["email"], json!("new@coke"));
        assert_eq!(driver.query_count(&Item::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn projection_restricts_the_result() {
        let driver = users_driver().await;
        driver
            .create(&item(&[
                ("projectid", json!("coke")),
                ("name", json!("alice")),
                ("email", json!("alice@coke")),
            ]))
            .await
            .unwrap();

        let mut options = QueryOptions::default();
        options.fields = Some(FieldsOptions {
            fields: vec!["name".into()],
        });
        let found = driver
            .query_one(&item(&[("projectid", json!("coke"))]), &options)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["name"], json!("alice"));
    }

    #[tokio::test]
    async fn delete_matches_keys_only() {
        let driver = users_driver().await;
        driver
            .create(&item(&[
                ("projectid", json!("coke")),
                ("name", json!("alice")),
                ("email", json!("alice@coke")),
            ]))
            .await
            .unwrap();

        // A stale non-key value must not prevent the delete.
        let removed = driver
            .delete(&item(&[
                ("projectid", json!("coke")),
                ("name", json!("alice")),
                ("email", json!("stale@coke")),
            ]))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(driver.query_count(&Item::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_many_scopes_by_partial_keys() {
        let driver = users_driver().await;
        for (project, name) in [("coke", "a"), ("coke", "b"), ("pepsi", "a")] {
            driver
                .create(&item(&[
                    ("projectid", json!(project)),
                    ("name", json!(name)),
                ]))
                .await
                .unwrap();
        }

        let removed = driver
            .delete_many(&item(&[("projectid", json!("coke"))]))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(driver.query_count(&Item::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn group_rows_keep_aggregate_columns() {
        let driver = users_driver().await;
        for (project, name) in [("coke", "a"), ("coke", "b"), ("pepsi", "a")] {
            driver
                .create(&item(&[
                    ("projectid", json!(project)),
                    ("name", json!(name)),
                ]))
                .await
                .unwrap();
        }

        let mut groups = driver
            .query_group(&Item::new(), &["projectid"], &["COUNT(*) as count"])
            .await
            .unwrap();
        groups.sort_by_key(|g| g["projectid"].as_str().unwrap().to_string());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["projectid"], json!("coke"));
        assert_eq!(groups[0]["count"], json!(2));
    }

    #[tokio::test]
    async fn auto_generated_key_comes_back_on_create() {
        let executor = Arc::new(SqliteExecutor::new(SqliteConfig::in_memory()));
        executor.connect().await.unwrap();
        executor
            .execute(
                "CREATE TABLE events (id INTEGER PRIMARY KEY AUTOINCREMENT, kind TEXT);",
                vec![],
            )
            .await
            .unwrap();

        let mut b = TableSchemaBuilder::new("events").unwrap();
        b.key("id").unwrap().auto_generated();
        b.field("kind").unwrap();
        let context = Arc::new(TableContext::new(
            Arc::new(b.build().unwrap()),
            CacheOptions::default(),
        ));
        let driver = TableDriver::new(context, executor);

        let created = driver
            .create(&item(&[("kind", json!("login"))]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created["id"], json!(1));
    }

    #[tokio::test]
    async fn update_existing_without_a_match_is_none() {
        let driver = users_driver().await;
        let missing = item(&[
            ("projectid", json!("coke")),
            ("name", json!("nobody")),
            ("email", json!("x@x")),
        ]);
        assert!(driver.update_existing(&missing).await.unwrap().is_none());
        assert_eq!(driver.query_count(&Item::new()).await.unwrap(), 0);

        driver.create(&missing).await.unwrap();
        let mut changed = missing.clone();
        changed.insert("email".into(), json!("y@y"));
        let updated = driver.update_existing(&changed).await.unwrap().unwrap();
        assert_eq!(updated["email"], json!("y@y"));
    }

    #[tokio::test]
    async fn delete_many_filters_on_non_key_columns() {
        let driver = users_driver().await;
        for (name, email) in [("alice", "a@a"), ("bob", "b@b")] {
            driver
                .create(&item(&[
                    ("projectid", json!("coke")),
                    ("name", json!(name)),
                    ("email", json!(email)),
                ]))
                .await
                .unwrap();
        }

        let removed = driver
            .delete_many(&item(&[("email", json!("a@a"))]))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let mut options = QueryOptions::default();
        options.skip_cache = true;
        let rows = driver.query_many(&Item::new(), &options).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("bob"));
    }
}
