//! `PostgreSQL` backend.
//!
//! Tables are listed from `information_schema` of the connection's current
//! schema. Upserts hand each chunk of records to `PostgreSQL` as one JSON
//! parameter and let `json_populate_recordset` convert every value to its
//! column type, so the backend needs no per-column type mapping.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ferry_storage_models::{
    ListPrimaryKeysResponse, ListTablesResponse, Record, StorageType, TruncateRequest,
    TruncateResponse, UpsertRequest, UpsertResponse,
};
use moosicbox_json_utils::database::ToValue as _;
use serde_json::Value;
use switchy_database::{Database, DatabaseTransaction, DatabaseValue};
use switchy_database_connection::Credentials;
use tokio_util::sync::CancellationToken;

use crate::txn::{Operation, Session, Txn};
use crate::wire::decode_upsert_records;
use crate::{Storage, StorageError};

/// Number of records per INSERT statement.
const CHUNK_SIZE: usize = 1_000;

/// A `PostgreSQL` connection.
pub struct Postgres {
    db: Box<dyn Database>,
    dns: String,
}

impl Postgres {
    /// Connects to `dns`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] if the connection string is
    /// invalid or the server is unreachable.
    pub async fn connect(dns: &str) -> Result<Self, StorageError> {
        Ok(Self {
            db: connect_database(dns).await?,
            dns: dns.to_string(),
        })
    }
}

/// Opens one connection with a 120-second `statement_timeout`.
async fn connect_database(dns: &str) -> Result<Box<dyn Database>, StorageError> {
    // The credentials parser rejects query parameters such as
    // `?sslmode=require`; TLS is negotiated by the connector.
    let url_base = dns.split('?').next().unwrap_or(dns);

    let creds = Credentials::from_url(url_base)
        .map_err(|e| StorageError::connection(StorageType::Postgres, e))?;
    let db = switchy_database_connection::init_postgres_raw_native_tls(creds)
        .await
        .map_err(|e| StorageError::connection(StorageType::Postgres, e))?;

    db.exec_raw("SET statement_timeout = '120s'").await?;

    Ok(db)
}

#[async_trait]
impl Storage for Postgres {
    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        drop(self.db);
        log::debug!("Closed PostgreSQL connection");
        Ok(())
    }

    async fn list_tables(&self) -> Result<ListTablesResponse, StorageError> {
        Ok(ListTablesResponse {
            table_set: table_names(self.db.as_ref()).await?,
        })
    }

    async fn list_primary_keys(&self) -> Result<ListPrimaryKeysResponse, StorageError> {
        Ok(ListPrimaryKeysResponse {
            pk_set: primary_keys(self.db.as_ref()).await?,
        })
    }

    async fn truncate(&self, request: &TruncateRequest) -> Result<TruncateResponse, StorageError> {
        truncate_tables(self.db.as_ref(), request).await
    }

    async fn upsert(&self, request: &UpsertRequest) -> Result<UpsertResponse, StorageError> {
        upsert_into(self.db.as_ref(), request).await
    }

    async fn start_tx(&self, cancel: CancellationToken) -> Result<Txn, StorageError> {
        // Each Txn gets its own connection so transactions never share one.
        let db = connect_database(&self.dns).await?;
        Ok(Txn::start(PostgresSession { db, txn: None }, None, cancel))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Postgres
    }
}

/// A dedicated connection running a sequence of transactions.
pub struct PostgresSession {
    db: Box<dyn Database>,
    txn: Option<Box<dyn DatabaseTransaction>>,
}

impl PostgresSession {
    fn open(&self) -> Result<&dyn DatabaseTransaction, StorageError> {
        self.txn
            .as_deref()
            .ok_or_else(|| StorageError::Configuration {
                message: "no PostgreSQL transaction is open".to_string(),
            })
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn begin(&mut self) -> Result<(), StorageError> {
        self.txn = Some(self.db.begin_transaction().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        if let Some(txn) = self.txn.take() {
            txn.commit().await?;
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), StorageError> {
        if let Some(txn) = self.txn.take() {
            txn.rollback().await?;
        }
        Ok(())
    }

    async fn apply(&mut self, operation: &Operation) -> Result<UpsertResponse, StorageError> {
        let txn = self.open()?;
        match operation {
            Operation::Upsert(request) => upsert_into(txn, request).await,
            Operation::Truncate(request) => {
                truncate_tables(txn, request).await?;
                Ok(UpsertResponse::default())
            }
        }
    }
}

fn conversion(column: &str, error: impl std::fmt::Display) -> StorageError {
    StorageError::Conversion {
        message: format!("Failed to parse {column}: {error}"),
    }
}

async fn table_names(db: &dyn Database) -> Result<BTreeSet<String>, StorageError> {
    let rows = db
        .query_raw_params(
            "SELECT table_name::text AS table_name
             FROM information_schema.tables
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'",
            &[],
        )
        .await?;

    rows.iter()
        .map(|row| {
            row.to_value("table_name")
                .map_err(|e| conversion("table_name", e))
        })
        .collect()
}

const PRIMARY_KEY_COLUMNS: &str = "SELECT kcu.table_name::text AS table_name,
        kcu.column_name::text AS column_name
     FROM information_schema.table_constraints tc
     JOIN information_schema.key_column_usage kcu
       ON tc.constraint_schema = kcu.constraint_schema
      AND tc.constraint_name = kcu.constraint_name
      AND tc.table_name = kcu.table_name
     WHERE tc.constraint_type = 'PRIMARY KEY'
       AND tc.table_schema = current_schema()";

/// Key columns of every table that has a primary key, in key order.
async fn primary_keys(db: &dyn Database) -> Result<BTreeMap<String, Vec<String>>, StorageError> {
    let rows = db
        .query_raw_params(
            &format!("{PRIMARY_KEY_COLUMNS} ORDER BY kcu.table_name, kcu.ordinal_position"),
            &[],
        )
        .await?;

    let mut pk_set: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in &rows {
        let table: String = row
            .to_value("table_name")
            .map_err(|e| conversion("table_name", e))?;
        let column: String = row
            .to_value("column_name")
            .map_err(|e| conversion("column_name", e))?;
        pk_set.entry(table).or_default().push(column);
    }
    Ok(pk_set)
}

async fn primary_key_for(db: &dyn Database, table: &str) -> Result<Vec<String>, StorageError> {
    let rows = db
        .query_raw_params(
            &format!(
                "{PRIMARY_KEY_COLUMNS} AND kcu.table_name::text = $1::text
                 ORDER BY kcu.ordinal_position"
            ),
            &[DatabaseValue::String(table.to_string())],
        )
        .await?;

    rows.iter()
        .map(|row| {
            row.to_value("column_name")
                .map_err(|e| conversion("column_name", e))
        })
        .collect()
}

async fn column_names(db: &dyn Database, table: &str) -> Result<Vec<String>, StorageError> {
    let rows = db
        .query_raw_params(
            "SELECT column_name::text AS column_name
             FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name::text = $1::text
             ORDER BY ordinal_position",
            &[DatabaseValue::String(table.to_string())],
        )
        .await?;

    rows.iter()
        .map(|row| {
            row.to_value("column_name")
                .map_err(|e| conversion("column_name", e))
        })
        .collect()
}

async fn truncate_tables(
    db: &dyn Database,
    request: &TruncateRequest,
) -> Result<TruncateResponse, StorageError> {
    for table in &request.tables {
        db.exec_raw(&format!("TRUNCATE TABLE {}", quote_ident(table)))
            .await
            .map_err(|e| StorageError::Truncate {
                table: table.clone(),
                source: Box::new(e.into()),
            })?;
        log::debug!("Truncated {table}");
    }
    Ok(TruncateResponse {})
}

async fn upsert_into(
    db: &dyn Database,
    request: &UpsertRequest,
) -> Result<UpsertResponse, StorageError> {
    let records = decode_upsert_records(request)?;
    if records.is_empty() {
        return Ok(UpsertResponse::default());
    }
    let table = request.table.as_str();

    let key = primary_key_for(db, table).await?;
    if key.is_empty() {
        return Err(StorageError::Configuration {
            message: format!("table {table} has no primary key to upsert on"),
        });
    }

    let table_columns = column_names(db, table).await?;
    let (columns, ignored) = present_columns(&table_columns, &records);
    if !ignored.is_empty() {
        log::warn!(
            "Ignoring fields with no column in {table}: {}",
            ignored.into_iter().collect::<Vec<_>>().join(", ")
        );
    }

    let deduped = dedupe_by_key(&records, &key, table)?;
    if deduped.len() < records.len() {
        log::info!(
            "Deduplicated upsert batch for {table}: {} -> {} rows",
            records.len(),
            deduped.len(),
        );
    }

    let sql = build_upsert_statement(table, &columns, &key);
    let mut response = UpsertResponse::default();

    for chunk in deduped.chunks(CHUNK_SIZE) {
        let payload = serde_json::to_string(chunk).map_err(|e| StorageError::Conversion {
            message: format!("Failed to encode records for {table}: {e}"),
        })?;
        let rows = db
            .query_raw_params(&sql, &[DatabaseValue::String(payload)])
            .await?;

        for row in &rows {
            let inserted: i32 = row
                .to_value("inserted")
                .map_err(|e| conversion("inserted", e))?;
            if inserted == 1 {
                response.upserted_count += 1;
            } else {
                response.matched_count += 1;
            }
        }
    }

    Ok(response)
}

/// Quotes an identifier for interpolation into SQL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Splits record fields into table columns that appear in at least one
/// record (in table order) and fields with no matching column.
fn present_columns<'a>(
    table_columns: &'a [String],
    records: &[Record],
) -> (Vec<&'a str>, BTreeSet<String>) {
    let fields: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.keys().map(String::as_str))
        .collect();

    let columns = table_columns
        .iter()
        .map(String::as_str)
        .filter(|column| fields.contains(column))
        .collect();
    let ignored = fields
        .into_iter()
        .filter(|field| !table_columns.iter().any(|column| column == field))
        .map(str::to_string)
        .collect();

    (columns, ignored)
}

/// Keeps the last occurrence of each primary key value, preserving the
/// relative order of the survivors.
///
/// `ON CONFLICT DO UPDATE` refuses to touch the same row twice in one
/// statement.
fn dedupe_by_key<'a>(
    records: &'a [Record],
    key: &[String],
    table: &str,
) -> Result<Vec<&'a Record>, StorageError> {
    let mut last_seen: BTreeMap<String, usize> = BTreeMap::new();
    for (i, record) in records.iter().enumerate() {
        let mut values = Vec::with_capacity(key.len());
        for column in key {
            match record.get(column) {
                Some(value) if !value.is_null() => values.push(value.clone()),
                _ => {
                    return Err(StorageError::Decode {
                        table: table.to_string(),
                        message: format!("record {i} has no value for key column {column}"),
                    });
                }
            }
        }
        last_seen.insert(Value::Array(values).to_string(), i);
    }

    let keep: BTreeSet<usize> = last_seen.into_values().collect();
    Ok(records
        .iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, record)| record)
        .collect())
}

fn build_upsert_statement(table: &str, columns: &[&str], key: &[String]) -> String {
    let table = quote_ident(table);
    let column_list = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let key_list = key
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");

    let mut updates: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|column| !key.iter().any(|k| k == column))
        .collect();
    // DO NOTHING would return no row for a match, so key-only tables
    // rewrite the key to itself.
    if updates.is_empty() {
        updates.extend(key.first().map(String::as_str));
    }

    let assignments = updates
        .iter()
        .map(|column| {
            let column = quote_ident(column);
            format!("{column} = EXCLUDED.{column}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM json_populate_recordset(NULL::{table}, $1::text::json) \
         ON CONFLICT ({key_list}) DO UPDATE SET {assignments} \
         RETURNING (xmax = 0)::int AS inserted"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(json: &str) -> Vec<Record> {
        decode_upsert_records(&UpsertRequest::new("t", json.as_bytes().to_vec())).unwrap()
    }

    fn key(columns: &[&str]) -> Vec<String> {
        columns.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("products"), "\"products\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn builds_upsert_statement_updating_non_key_columns() {
        let sql = build_upsert_statement("products", &["id", "name", "price"], &key(&["id"]));
        assert_eq!(
            sql,
            "INSERT INTO \"products\" (\"id\", \"name\", \"price\") \
             SELECT \"id\", \"name\", \"price\" \
             FROM json_populate_recordset(NULL::\"products\", $1::text::json) \
             ON CONFLICT (\"id\") DO UPDATE SET \
             \"name\" = EXCLUDED.\"name\", \"price\" = EXCLUDED.\"price\" \
             RETURNING (xmax = 0)::int AS inserted"
        );
    }

    #[test]
    fn key_only_table_still_returns_matched_rows() {
        let sql = build_upsert_statement("tags", &["a", "b"], &key(&["a", "b"]));
        assert!(sql.contains("ON CONFLICT (\"a\", \"b\") DO UPDATE SET \"a\" = EXCLUDED.\"a\""));
        assert!(sql.ends_with("RETURNING (xmax = 0)::int AS inserted"));
    }

    #[test]
    fn dedupe_keeps_last_occurrence_in_order() {
        let batch = records(r#"[{"id":1,"v":"a"},{"id":2,"v":"b"},{"id":1,"v":"c"}]"#);
        let deduped = dedupe_by_key(&batch, &key(&["id"]), "t").unwrap();
        let values: Vec<&str> = deduped.iter().map(|r| r["v"].as_str().unwrap()).collect();
        assert_eq!(values, vec!["b", "c"]);
    }

    #[test]
    fn dedupe_distinguishes_composite_keys() {
        let batch = records(r#"[{"a":1,"b":1},{"a":1,"b":2},{"a":1,"b":1}]"#);
        let deduped = dedupe_by_key(&batch, &key(&["a", "b"]), "t").unwrap();
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn dedupe_rejects_records_without_key_value() {
        let batch = records(r#"[{"id":1},{"id":null}]"#);
        let err = dedupe_by_key(&batch, &key(&["id"]), "t").unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to decode records for table t: record 1 has no value for key column id"
        );
    }

    #[test]
    fn present_columns_follow_table_order_and_report_unknown_fields() {
        let table_columns = key(&["id", "name", "price", "stock"]);
        let batch = records(r#"[{"price":1,"id":1},{"id":2,"name":"x","extra":true}]"#);

        let (columns, ignored) = present_columns(&table_columns, &batch);

        assert_eq!(columns, vec!["id", "name", "price"]);
        assert_eq!(ignored.into_iter().collect::<Vec<_>>(), vec!["extra"]);
    }
}
