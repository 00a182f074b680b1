//! Table query builder
//!
//! A small fluent builder over `DatabaseAdapter`: table selection, joins,
//! equality and `IN` predicates, and the read/write terminals the relation
//! engine needs. Values are always bound as `?N` parameters.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{AdapterError, AdapterResult, DatabaseAdapter, Row, SqlValue};

#[derive(Debug, Clone)]
enum Predicate {
    Eq(String, Value),
    In(String, Vec<Value>),
}

#[derive(Debug, Clone)]
struct Join {
    table: String,
    first: String,
    second: String,
}

#[derive(Clone)]
pub struct SqlQuery {
    adapter: Arc<dyn DatabaseAdapter>,
    table: String,
    columns: Vec<String>,
    joins: Vec<Join>,
    wheres: Vec<Predicate>,
    orders: Vec<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// Quote an identifier expression: `col`, `table.col`, `table.*`, `expr as alias`.
pub fn quote_column(expr: &str) -> String {
    let lower = expr.to_ascii_lowercase();
    if let Some(pos) = lower.find(" as ") {
        let (column, alias) = (&expr[..pos], &expr[pos + 4..]);
        return format!("{} AS \"{}\"", quote_column(column.trim()), alias.trim());
    }
    if expr == "*" {
        return "*".to_string();
    }
    expr.split('.')
        .map(|part| {
            if part == "*" {
                "*".to_string()
            } else {
                format!("\"{}\"", part)
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

impl SqlQuery {
    pub fn table(adapter: Arc<dyn DatabaseAdapter>, table: &str) -> Self {
        Self {
            adapter,
            table: table.to_string(),
            columns: Vec::new(),
            joins: Vec::new(),
            wheres: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Inner join `table` on `first = second`
    pub fn join(mut self, table: &str, first: &str, second: &str) -> Self {
        self.joins.push(Join {
            table: table.to_string(),
            first: first.to_string(),
            second: second.to_string(),
        });
        self
    }

    /// Replaces an earlier equality on the same column
    pub fn where_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.wheres
            .retain(|predicate| !matches!(predicate, Predicate::Eq(existing, _) if existing == column));
        self.wheres.push(Predicate::Eq(column.to_string(), value.into()));
        self
    }

    /// An empty value list matches nothing
    pub fn where_in(mut self, column: &str, values: Vec<Value>) -> Self {
        self.wheres.push(Predicate::In(column.to_string(), values));
        self
    }

    /// Ascending order on `column`
    pub fn order_by(mut self, column: &str) -> Self {
        self.orders.push(column.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    fn where_clause(&self, params: &mut Vec<SqlValue>) -> String {
        if self.wheres.is_empty() {
            return String::new();
        }

        let clauses: Vec<String> = self
            .wheres
            .iter()
            .map(|predicate| match predicate {
                Predicate::Eq(column, Value::Null) => format!("{} IS NULL", quote_column(column)),
                Predicate::Eq(column, value) => {
                    params.push(SqlValue::from(value));
                    format!("{} = ?{}", quote_column(column), params.len())
                }
                Predicate::In(_, values) if values.is_empty() => "0 = 1".to_string(),
                Predicate::In(column, values) => {
                    let placeholders: Vec<String> = values
                        .iter()
                        .map(|value| {
                            params.push(SqlValue::from(value));
                            format!("?{}", params.len())
                        })
                        .collect();
                    format!("{} IN ({})", quote_column(column), placeholders.join(", "))
                }
            })
            .collect();

        format!(" WHERE {}", clauses.join(" AND "))
    }

    fn from_clause(&self) -> String {
        let mut sql = format!(" FROM \"{}\"", self.table);
        for join in &self.joins {
            sql.push_str(&format!(
                " INNER JOIN \"{}\" ON {} = {}",
                join.table,
                quote_column(&join.first),
                quote_column(&join.second)
            ));
        }
        sql
    }

    pub fn to_select_sql(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| quote_column(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {}{}", columns, self.from_clause());
        sql.push_str(&self.where_clause(&mut params));
        if !self.orders.is_empty() {
            let orders: Vec<String> = self.orders.iter().map(|c| format!("{} ASC", quote_column(c))).collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }
        (sql, params)
    }

    pub fn get(&self) -> AdapterResult<Vec<Row>> {
        let (sql, params) = self.to_select_sql();
        debug!(sql = %sql, params = params.len(), "relational select");
        Ok(self.adapter.query(&sql, &params)?.into_rows())
    }

    pub fn first(&self) -> AdapterResult<Option<Row>> {
        Ok(self.clone().limit(1).get()?.into_iter().next())
    }

    pub fn count(&self) -> AdapterResult<u64> {
        let mut params = Vec::new();
        let mut sql = format!("SELECT COUNT(*){}", self.from_clause());
        sql.push_str(&self.where_clause(&mut params));

        let result = self.adapter.query(&sql, &params)?;
        result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .ok_or_else(|| AdapterError::Query(format!("COUNT returned no value for {}", self.table)))
    }

    /// Values of one column across the matching rows
    pub fn pluck(&self, column: &str) -> AdapterResult<Vec<Value>> {
        let rows = self.clone().select([column]).get()?;
        let key = column.rsplit('.').next().unwrap_or(column);
        Ok(rows
            .into_iter()
            .filter_map(|mut row| row.remove(key))
            .collect())
    }

    /// Insert rows in one transaction
    pub fn insert(&self, rows: &[Row]) -> AdapterResult<Vec<i64>> {
        debug!(table = %self.table, rows = rows.len(), "relational insert");
        self.adapter.insert_rows(&self.table, rows)
    }

    pub fn update(&self, values: &Row) -> AdapterResult<u64> {
        if values.is_empty() {
            return Ok(0);
        }

        let mut params: Vec<SqlValue> = Vec::with_capacity(values.len());
        let set_clauses: Vec<String> = values
            .iter()
            .map(|(column, value)| {
                params.push(SqlValue::from(value));
                format!("\"{}\" = ?{}", column, params.len())
            })
            .collect();

        let mut sql = format!("UPDATE \"{}\" SET {}", self.table, set_clauses.join(", "));
        sql.push_str(&self.where_clause(&mut params));
        debug!(sql = %sql, "relational update");
        Ok(self.adapter.execute(&sql, &params)?.affected_rows)
    }

    pub fn delete(&self) -> AdapterResult<u64> {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM \"{}\"", self.table);
        sql.push_str(&self.where_clause(&mut params));
        debug!(sql = %sql, "relational delete");
        Ok(self.adapter.execute(&sql, &params)?.affected_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::adapter::SqliteAdapter;
    use serde_json::json;

    fn adapter() -> Arc<dyn DatabaseAdapter> {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter
            .execute_batch(
                "CREATE TABLE projects (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE members (id INTEGER PRIMARY KEY, project_id INTEGER, role TEXT);
                 INSERT INTO projects (id, name) VALUES (1, 'alpha'), (2, 'beta'), (3, 'gamma');
                 INSERT INTO members (project_id, role) VALUES (1, 'owner'), (1, 'dev'), (2, 'dev');",
            )
            .unwrap();
        Arc::new(adapter)
    }

    #[test]
    fn test_quote_column() {
        assert_eq!(quote_column("id"), "\"id\"");
        assert_eq!(quote_column("members.role"), "\"members\".\"role\"");
        assert_eq!(quote_column("projects.*"), "\"projects\".*");
        assert_eq!(
            quote_column("members.role as pivot_role"),
            "\"members\".\"role\" AS \"pivot_role\""
        );
    }

    #[test]
    fn test_select_sql_numbers_placeholders() {
        let query = SqlQuery::table(adapter(), "projects")
            .where_eq("name", "alpha")
            .where_in("id", vec![json!(1), json!(2)]);
        let (sql, params) = query.to_select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM \"projects\" WHERE \"name\" = ?1 AND \"id\" IN (?2, ?3)"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_where_eq_replaces_same_column() {
        let (sql, params) = SqlQuery::table(adapter(), "projects")
            .where_eq("name", "alpha")
            .where_eq("name", "beta")
            .to_select_sql();
        assert_eq!(sql, "SELECT * FROM \"projects\" WHERE \"name\" = ?1");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_order_limit_offset_pages() {
        let db = adapter();
        let page = SqlQuery::table(db, "projects")
            .order_by("id")
            .limit(2)
            .offset(1)
            .pluck("name")
            .unwrap();
        assert_eq!(page, vec![json!("beta"), json!("gamma")]);
    }

    #[test]
    fn test_where_in_empty_matches_nothing() {
        let rows = SqlQuery::table(adapter(), "projects")
            .where_in("id", Vec::new())
            .get()
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_where_in_matches_string_keys_against_integer_column() {
        let rows = SqlQuery::table(adapter(), "projects")
            .where_in("id", vec![json!("1"), json!("3")])
            .get()
            .unwrap();
        let names: Vec<&Value> = rows.iter().map(|r| &r["name"]).collect();
        assert_eq!(names, vec![&json!("alpha"), &json!("gamma")]);
    }

    #[test]
    fn test_join_and_count() {
        let query = SqlQuery::table(adapter(), "projects")
            .select(["projects.*", "members.role as member_role"])
            .join("members", "projects.id", "members.project_id")
            .where_eq("members.role", "dev");
        assert_eq!(query.count().unwrap(), 2);

        let rows = query.get().unwrap();
        assert_eq!(rows[0]["member_role"], json!("dev"));
        assert!(rows[0].contains_key("name"));
    }

    #[test]
    fn test_first_update_delete() {
        let db = adapter();
        let first = SqlQuery::table(db.clone(), "projects")
            .where_eq("id", 2)
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(first["name"], json!("beta"));

        let mut values = Row::new();
        values.insert("name".into(), json!("beta-2"));
        let updated = SqlQuery::table(db.clone(), "projects")
            .where_eq("id", 2)
            .update(&values)
            .unwrap();
        assert_eq!(updated, 1);

        let deleted = SqlQuery::table(db.clone(), "projects")
            .where_eq("name", "beta-2")
            .delete()
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(SqlQuery::table(db, "projects").count().unwrap(), 2);
    }

    #[test]
    fn test_pluck_qualified_column() {
        let roles = SqlQuery::table(adapter(), "members")
            .where_eq("project_id", 1)
            .pluck("members.role")
            .unwrap();
        assert_eq!(roles, vec![json!("owner"), json!("dev")]);
    }
}
