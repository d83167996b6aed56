//! SQLite record store
//!
//! All collections share the `records` table created by
//! `bunkreq_common::db::init`. Filters compile to `json_extract`
//! predicates over the JSON body; writes retry on lock contention.

use super::{apply_patch, clamp_page, take_id, Filter, ListResult, Literal, Record, RecordStore};
use crate::utils::retry_on_lock;
use async_trait::async_trait;
use bunkreq_common::db::{init_database, init_memory_database};
use bunkreq_common::{Error, Result};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use std::path::Path;

const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Bound parameter of a compiled filter
#[derive(Debug, Clone, PartialEq)]
enum SqlParam {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Record store over a sqlx SQLite pool
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    /// Open (creating and migrating if needed) a database file
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(init_database(path).await?))
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(init_memory_database().await?))
    }

    pub fn with_max_lock_wait(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn map_write_error(err: sqlx::Error) -> Error {
    let err = Error::from(err);
    if err.is_unique_violation() {
        Error::UniqueViolation(err.to_string())
    } else {
        err
    }
}

fn parse_body(id: &str, body: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Internal(format!(
            "Record {} body is not a JSON object",
            id
        ))),
    }
}

/// SQL expression addressing `field`
fn field_expr(field: &str) -> Result<String> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidInput(format!("Invalid filter field '{}'", field)));
    }
    if field == "id" {
        Ok("id".to_string())
    } else {
        Ok(format!("json_extract(data, '$.{}')", field))
    }
}

fn compile_eq(field: &str, literal: &Literal, params: &mut Vec<SqlParam>) -> Result<String> {
    let expr = field_expr(field)?;
    Ok(match literal {
        Literal::Null => format!("({expr} IS NULL OR {expr} = '')"),
        Literal::Bool(b) => {
            params.push(SqlParam::Int(*b as i64));
            format!(
                "(json_type(data, '$.{field}') IN ('true', 'false') AND {expr} = ?)"
            )
        }
        Literal::Int(i) => {
            params.push(SqlParam::Int(*i));
            format!("{expr} = ?")
        }
        Literal::Float(f) => {
            params.push(SqlParam::Float(*f));
            format!("{expr} = ?")
        }
        Literal::Str(s) => {
            params.push(SqlParam::Text(s.clone()));
            format!("{expr} = ?")
        }
    })
}

/// Compile a filter into a WHERE fragment plus its bound parameters
fn compile(filter: &Filter, params: &mut Vec<SqlParam>) -> Result<String> {
    match filter {
        Filter::Eq(field, literal) => compile_eq(field, literal, params),
        // A missing field compares NULL; treat that as "not equal"
        Filter::Ne(field, literal) => Ok(format!(
            "NOT COALESCE({}, 0)",
            compile_eq(field, literal, params)?
        )),
        Filter::And(terms) | Filter::Or(terms) if terms.is_empty() => {
            Ok(if matches!(filter, Filter::And(_)) { "1" } else { "0" }.to_string())
        }
        Filter::And(terms) => join_terms(terms, " AND ", params),
        Filter::Or(terms) => join_terms(terms, " OR ", params),
    }
}

fn join_terms(terms: &[Filter], op: &str, params: &mut Vec<SqlParam>) -> Result<String> {
    let parts = terms
        .iter()
        .map(|t| compile(t, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", parts.join(op)))
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create(&self, collection: &str, mut data: Map<String, Value>) -> Result<Record> {
        let id = take_id(&mut data);
        let body = serde_json::to_string(&data)?;

        retry_on_lock("record create", self.max_lock_wait_ms, || {
            let pool = self.pool.clone();
            let (id, body) = (id.clone(), body.clone());
            async move {
                sqlx::query("INSERT INTO records (id, collection, data) VALUES (?, ?, ?)")
                    .bind(&id)
                    .bind(collection)
                    .bind(&body)
                    .execute(&pool)
                    .await
                    .map_err(map_write_error)?;
                Ok::<_, Error>(())
            }
        })
        .await?;

        tracing::debug!(collection, id = %id, "Created record");
        Ok(Record { id, data })
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Record> {
        let mut record = self
            .get_by_id(collection, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} record {}", collection, id)))?;
        apply_patch(&mut record.data, patch);
        let body = serde_json::to_string(&record.data)?;

        let affected = retry_on_lock("record update", self.max_lock_wait_ms, || {
            let pool = self.pool.clone();
            let body = body.clone();
            async move {
                let result = sqlx::query(
                    "UPDATE records SET data = ?, updated_at = CURRENT_TIMESTAMP \
                     WHERE collection = ? AND id = ?",
                )
                .bind(&body)
                .bind(collection)
                .bind(id)
                .execute(&pool)
                .await
                .map_err(map_write_error)?;
                Ok::<_, Error>(result.rows_affected())
            }
        })
        .await?;

        // Deleted between read and write
        if affected == 0 {
            return Err(Error::NotFound(format!("{} record {}", collection, id)));
        }
        Ok(record)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let affected = retry_on_lock("record delete", self.max_lock_wait_ms, || {
            let pool = self.pool.clone();
            async move {
                let result = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
                    .bind(collection)
                    .bind(id)
                    .execute(&pool)
                    .await?;
                Ok::<_, Error>(result.rows_affected())
            }
        })
        .await?;

        Ok(affected > 0)
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let row = sqlx::query("SELECT id, data FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let id: String = row.get("id");
                let body: String = row.get("data");
                let data = parse_body(&id, &body)?;
                Ok(Some(Record { id, data }))
            }
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        collection: &str,
        filter: Option<&Filter>,
        page: u32,
        per_page: u32,
    ) -> Result<ListResult> {
        let (page, per_page) = clamp_page(page, per_page);
        let mut params = Vec::new();
        let mut where_clause = "collection = ?".to_string();
        if let Some(filter) = filter {
            where_clause.push_str(" AND ");
            where_clause.push_str(&compile(filter, &mut params)?);
        }

        let count_sql = format!("SELECT COUNT(*) FROM records WHERE {}", where_clause);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(collection);
        for param in &params {
            count_query = match param {
                SqlParam::Int(v) => count_query.bind(*v),
                SqlParam::Float(v) => count_query.bind(*v),
                SqlParam::Text(v) => count_query.bind(v.as_str()),
            };
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let page_sql = format!(
            "SELECT id, data FROM records WHERE {} ORDER BY seq LIMIT ? OFFSET ?",
            where_clause
        );
        let mut page_query = sqlx::query(&page_sql).bind(collection);
        for param in &params {
            page_query = match param {
                SqlParam::Int(v) => page_query.bind(*v),
                SqlParam::Float(v) => page_query.bind(*v),
                SqlParam::Text(v) => page_query.bind(v.as_str()),
            };
        }
        let offset = (page as i64 - 1) * per_page as i64;
        let rows = page_query
            .bind(per_page as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let body: String = row.get("data");
            let data = parse_body(&id, &body)?;
            items.push(Record { id, data });
        }

        Ok(ListResult {
            items,
            total: total.max(0) as u64,
            page,
            per_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_eq_string() {
        let mut params = Vec::new();
        let sql = compile(&Filter::eq("bunk_request", "br1"), &mut params).unwrap();

        assert_eq!(sql, "json_extract(data, '$.bunk_request') = ?");
        assert_eq!(params, vec![SqlParam::Text("br1".to_string())]);
    }

    #[test]
    fn test_compile_null_and_ne() {
        let mut params = Vec::new();
        let filter = Filter::eq("merged_into", Literal::Null).and(Filter::ne("status", "resolved"));
        let sql = compile(&filter, &mut params).unwrap();

        assert!(sql.contains("json_extract(data, '$.merged_into') IS NULL"));
        assert!(sql.contains("NOT COALESCE(json_extract(data, '$.status') = ?, 0)"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_id_field_uses_column() {
        let mut params = Vec::new();
        let sql = compile(&Filter::eq("id", "abc"), &mut params).unwrap();
        assert_eq!(sql, "id = ?");
    }

    #[test]
    fn test_field_injection_rejected() {
        let mut params = Vec::new();
        let filter = Filter::eq("x') OR 1=1 --", "y");
        assert!(compile(&filter, &mut params).is_err());
    }
}
