//! JSON-document store on SQLite.
//!
//! Each collection is a table `(id TEXT PRIMARY KEY, doc TEXT NOT NULL)` where
//! `doc` is the full JSON document including `_id`. Field predicates and
//! indexes use `json_extract(doc, '$.field')`. Several processes may open the
//! same file; writes serialise on SQLite's database lock, and every
//! conditional write is a single statement or an IMMEDIATE transaction.
//! A collection's table appears with its first insert or index; until then
//! reads and updates see it empty.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use super::{
    catalog, Document, DocumentDb, DuplicateValue, Filter, FindOptions, IndexInfo, IndexSpec,
    ReturnDocument, Update, ID_FIELD,
};
use crate::error::{
    AppError, WriteFailure, DUPLICATE_KEY_CODE, INDEX_KEY_SPECS_CONFLICT_CODE,
    INDEX_OPTIONS_CONFLICT_CODE,
};
use crate::validation::require_identifier;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }
}

/// Pooled SQLite document store. Cheap to clone.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    path: PathBuf,
    /// Collections whose table is known to exist in this process.
    known: Arc<Mutex<HashSet<String>>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, AppError> {
        Self::open_with_pool_size(path, 8)
    }

    pub fn open_with_pool_size(path: &Path, max_size: u32) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "Opening document store");

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_customizer(Box::new(SqlitePragmaCustomizer))
            .build(manager)?;

        // WAL is database-wide, set once.
        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            catalog::run(&conn)?;
        }

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            known: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a pooled connection off the async runtime.
    async fn with_conn<T, F>(&self, collection: Option<&str>, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
    {
        if let Some(name) = collection {
            require_identifier("collection", name)?;
        }
        let pool = self.pool.clone();
        let known = self.known.clone();
        let collection = collection.map(str::to_string);

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            if let Some(name) = collection {
                ensure_collection(&conn, &known, &name)?;
            }
            f(&mut conn)
        })
        .await
        .map_err(|e| AppError::Internal(format!("database task failed: {e}")))?
    }

    /// Like `with_conn` for reads and non-inserting writes: a collection with
    /// no table yet yields `missing` and is not created.
    async fn with_existing<T, F>(&self, collection: &str, missing: T, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
    {
        require_identifier("collection", collection)?;
        let pool = self.pool.clone();
        let known = self.known.clone();
        let name = collection.to_string();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            if !collection_exists(&conn, &known, &name)? {
                return Ok(missing);
            }
            f(&mut conn)
        })
        .await
        .map_err(|e| AppError::Internal(format!("database task failed: {e}")))?
    }
}

fn collection_exists(
    conn: &Connection,
    known: &Mutex<HashSet<String>>,
    name: &str,
) -> Result<bool, AppError> {
    if known.lock().unwrap_or_else(|e| e.into_inner()).contains(name) {
        return Ok(true);
    }
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if found {
        known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
    }
    Ok(found)
}

fn ensure_collection(
    conn: &Connection,
    known: &Mutex<HashSet<String>>,
    name: &str,
) -> Result<(), AppError> {
    {
        let known = known.lock().unwrap_or_else(|e| e.into_inner());
        if known.contains(name) {
            return Ok(());
        }
    }
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{name}\" (id TEXT PRIMARY KEY, doc TEXT NOT NULL);"
    ))?;
    known
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name.to_string());
    Ok(())
}

// ── SQL building ───────────────────────────────────────────────────

fn field_expr(field: &str) -> Result<String, AppError> {
    if field == ID_FIELD {
        return Ok("id".to_string());
    }
    require_identifier("field", field)?;
    Ok(format!("json_extract(doc, '$.{field}')"))
}

fn type_expr(field: &str) -> Result<String, AppError> {
    require_identifier("field", field)?;
    Ok(format!("json_type(doc, '$.{field}')"))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn compile_filter(filter: &Filter, params: &mut Vec<SqlValue>) -> Result<String, AppError> {
    let sql = match filter {
        Filter::Eq(field, Value::Null) => format!("({} IS NULL)", field_expr(field)?),
        Filter::Eq(field, value) => {
            params.push(to_sql_value(value));
            format!("({} = ?)", field_expr(field)?)
        }
        Filter::Lte(field, value) => {
            params.push(to_sql_value(value));
            format!("({} <= ?)", field_expr(field)?)
        }
        Filter::Exists(field, present) if field == ID_FIELD => {
            if *present { "1".into() } else { "0".into() }
        }
        Filter::Exists(field, present) => {
            let op = if *present { "IS NOT NULL" } else { "IS NULL" };
            format!("({} {op})", type_expr(field)?)
        }
        Filter::IsString(field) if field == ID_FIELD => "1".into(),
        Filter::IsString(field) => format!("({} = 'text')", type_expr(field)?),
        Filter::And(parts) | Filter::Or(parts) if parts.is_empty() => {
            if matches!(filter, Filter::And(_)) { "1".into() } else { "0".into() }
        }
        Filter::And(parts) => join_filters(parts, " AND ", params)?,
        Filter::Or(parts) => join_filters(parts, " OR ", params)?,
    };
    Ok(sql)
}

fn join_filters(parts: &[Filter], sep: &str, params: &mut Vec<SqlValue>) -> Result<String, AppError> {
    let compiled = parts
        .iter()
        .map(|p| compile_filter(p, params))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})", compiled.join(sep)))
}

fn compile_update(update: &Update, params: &mut Vec<SqlValue>) -> Result<String, AppError> {
    let mut expr = "doc".to_string();
    for field in &update.unset {
        if field == ID_FIELD {
            return Err(AppError::Validation("_id cannot be unset".into()));
        }
        require_identifier("field", field)?;
        expr = format!("json_remove({expr}, '$.{field}')");
    }
    for (field, value) in &update.set {
        if field == ID_FIELD {
            return Err(AppError::Validation("_id is immutable".into()));
        }
        require_identifier("field", field)?;
        params.push(SqlValue::Text(value.to_string()));
        expr = format!("json_set({expr}, '$.{field}', json(?))");
    }
    Ok(expr)
}

fn parse_doc(text: &str) -> Result<Document, AppError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        other => Err(AppError::Internal(format!("stored document is not an object: {other}"))),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

fn duplicate_key_message(collection: &str, err: &rusqlite::Error) -> String {
    format!("E11000 duplicate key error collection: {collection} ({err})")
}

fn map_write_error(collection: &str, err: rusqlite::Error) -> AppError {
    if is_unique_violation(&err) {
        AppError::Write {
            code: DUPLICATE_KEY_CODE,
            message: duplicate_key_message(collection, &err),
        }
    } else {
        AppError::Database(err)
    }
}

/// Assign `_id` if missing and serialise.
fn prepare_insert(mut doc: Document) -> Result<(String, String), AppError> {
    let id = match doc.get(ID_FIELD) {
        None | Some(Value::Null) => {
            let id = uuid::Uuid::new_v4().to_string();
            doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            id
        }
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(AppError::Validation(format!("_id must be a string, got {other}")));
        }
    };
    let body = serde_json::to_string(&doc)?;
    Ok((id, body))
}

fn insert_row(conn: &Connection, collection: &str, id: &str, body: &str) -> Result<(), AppError> {
    conn.execute(
        &format!("INSERT INTO \"{collection}\" (id, doc) VALUES (?1, ?2)"),
        rusqlite::params![id, body],
    )
    .map_err(|e| map_write_error(collection, e))?;
    Ok(())
}

fn project(mut doc: Document, fields: &[String]) -> Document {
    doc.retain(|k, _| k == ID_FIELD || fields.iter().any(|f| f == k));
    doc
}

// ── DocumentDb impl ────────────────────────────────────────────────

#[async_trait]
impl DocumentDb for SqliteStore {
    async fn ping(&self) -> Result<(), AppError> {
        self.with_conn(None, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<(), AppError> {
        require_identifier("index name", &spec.name)?;
        require_identifier("field", &spec.field)?;
        if spec.direction != 1 && spec.direction != -1 {
            return Err(AppError::Validation(format!(
                "index direction must be 1 or -1, got {}",
                spec.direction
            )));
        }

        let coll = collection.to_string();
        let spec = spec.clone();
        self.with_conn(Some(collection), move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing) = catalog::get(&tx, &coll, &spec.name)? {
                if existing.field != spec.field || existing.direction != spec.direction {
                    return Err(AppError::Command {
                        code: INDEX_KEY_SPECS_CONFLICT_CODE,
                        message: format!(
                            "index {:?} already exists with key {{{}: {}}}",
                            spec.name, existing.field, existing.direction
                        ),
                    });
                }
                if existing.unique != spec.unique {
                    return Err(AppError::Command {
                        code: INDEX_OPTIONS_CONFLICT_CODE,
                        message: format!("index {:?} already exists with different options", spec.name),
                    });
                }
                return Ok(());
            }

            if let Some(other) = catalog::find_by_key(&tx, &coll, &spec.field, spec.direction)? {
                return Err(AppError::Command {
                    code: INDEX_OPTIONS_CONFLICT_CODE,
                    message: format!(
                        "index with key {{{}: {}}} already exists as {:?}",
                        spec.field, spec.direction, other.name
                    ),
                });
            }

            let unique = if spec.unique { "UNIQUE " } else { "" };
            let order = if spec.direction == 1 { "ASC" } else { "DESC" };
            let ddl = format!(
                "CREATE {unique}INDEX IF NOT EXISTS \"{coll}__{name}\" ON \"{coll}\" ({expr} {order})",
                name = spec.name,
                expr = field_expr(&spec.field)?,
            );
            if let Err(e) = tx.execute_batch(&ddl) {
                if is_unique_violation(&e) {
                    return Err(AppError::Command {
                        code: DUPLICATE_KEY_CODE,
                        message: format!(
                            "E11000 duplicate key error building index {}: {e}",
                            spec.name
                        ),
                    });
                }
                return Err(e.into());
            }

            catalog::insert(
                &tx,
                &coll,
                &catalog::CatalogEntry {
                    name: spec.name.clone(),
                    field: spec.field.clone(),
                    direction: spec.direction,
                    unique: spec.unique,
                },
            )?;
            tx.commit()?;

            tracing::debug!(collection = %coll, index = %spec.name, unique = spec.unique, "Index created");
            Ok(())
        })
        .await
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, AppError> {
        require_identifier("collection", collection)?;
        let coll = collection.to_string();
        self.with_conn(None, move |conn| {
            let mut out = vec![IndexInfo {
                name: "_id_".into(),
                key: vec![(ID_FIELD.to_string(), Value::from(1))],
                unique: true,
            }];
            for entry in catalog::list(conn, &coll)? {
                out.push(IndexInfo {
                    name: entry.name,
                    key: vec![(entry.field, Value::from(entry.direction))],
                    unique: entry.unique,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        returning: ReturnDocument,
    ) -> Result<Option<Document>, AppError> {
        let mut filter_params = Vec::new();
        let where_sql = compile_filter(filter, &mut filter_params)?;
        let mut update_params = Vec::new();
        let set_sql = compile_update(update, &mut update_params)?;
        let coll = collection.to_string();

        self.with_existing(collection, None, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<(String, String)> = tx
                .query_row(
                    &format!("SELECT id, doc FROM \"{coll}\" WHERE {where_sql} LIMIT 1"),
                    params_from_iter(filter_params.iter()),
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((id, before)) = current else {
                tx.commit()?;
                return Ok(None);
            };

            update_params.push(SqlValue::Text(id));
            let after: String = tx
                .query_row(
                    &format!("UPDATE \"{coll}\" SET doc = {set_sql} WHERE id = ? RETURNING doc"),
                    params_from_iter(update_params.iter()),
                    |row| row.get(0),
                )
                .map_err(|e| map_write_error(&coll, e))?;
            tx.commit()?;

            let image = match returning {
                ReturnDocument::Before => before,
                ReturnDocument::After => after,
            };
            Ok(Some(parse_doc(&image)?))
        })
        .await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, AppError> {
        let mut params = Vec::new();
        let set_sql = compile_update(update, &mut params)?;
        let where_sql = compile_filter(filter, &mut params)?;
        let coll = collection.to_string();

        self.with_existing(collection, 0, move |conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE \"{coll}\" SET doc = {set_sql}
                         WHERE id = (SELECT id FROM \"{coll}\" WHERE {where_sql} LIMIT 1)"
                    ),
                    params_from_iter(params.iter()),
                )
                .map_err(|e| map_write_error(&coll, e))?;
            Ok(changed as u64)
        })
        .await
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String, AppError> {
        let (id, body) = prepare_insert(doc)?;
        let coll = collection.to_string();
        self.with_conn(Some(collection), move |conn| {
            insert_row(conn, &coll, &id, &body)?;
            Ok(id)
        })
        .await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<String>, AppError> {
        let prepared = docs
            .into_iter()
            .map(prepare_insert)
            .collect::<Result<Vec<_>, _>>()?;
        let coll = collection.to_string();

        self.with_conn(Some(collection), move |conn| {
            let mut ids = Vec::with_capacity(prepared.len());
            for (index, (id, body)) in prepared.into_iter().enumerate() {
                match insert_row(conn, &coll, &id, &body) {
                    Ok(()) => ids.push(id),
                    Err(AppError::Write { code, message }) => {
                        return Err(AppError::BulkWrite(vec![WriteFailure { index, code, message }]));
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(ids)
        })
        .await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Option<Document>, AppError> {
        let mut params = Vec::new();
        let where_sql = compile_filter(filter, &mut params)?;
        let order_sql = match &options.sort {
            Some((field, order)) => format!(" ORDER BY {} {}", field_expr(field)?, order.as_sql()),
            None => String::new(),
        };
        let projection = options.projection.clone();
        let coll = collection.to_string();

        self.with_existing(collection, None, move |conn| {
            let text: Option<String> = conn
                .query_row(
                    &format!("SELECT doc FROM \"{coll}\" WHERE {where_sql}{order_sql} LIMIT 1"),
                    params_from_iter(params.iter()),
                    |row| row.get(0),
                )
                .optional()?;
            let Some(text) = text else {
                return Ok(None);
            };
            let doc = parse_doc(&text)?;
            Ok(Some(match &projection {
                Some(fields) => project(doc, fields),
                None => doc,
            }))
        })
        .await
    }

    async fn count_documents(&self, collection: &str, filter: &Filter) -> Result<u64, AppError> {
        let mut params = Vec::new();
        let where_sql = compile_filter(filter, &mut params)?;
        let coll = collection.to_string();
        self.with_existing(collection, 0, move |conn| {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{coll}\" WHERE {where_sql}"),
                params_from_iter(params.iter()),
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn duplicate_string_values(
        &self,
        collection: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<DuplicateValue>, AppError> {
        let value_sql = field_expr(field)?;
        let type_sql = type_expr(field)?;
        let coll = collection.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_existing(collection, Vec::new(), move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {value_sql} AS v, COUNT(*) AS c FROM \"{coll}\"
                 WHERE {type_sql} = 'text'
                 GROUP BY v HAVING c > 1
                 ORDER BY c DESC, v
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map([limit], |row| {
                Ok(DuplicateValue {
                    value: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

/// Fresh store on a unique temp file, for tests.
#[cfg(test)]
pub fn open_test_store() -> Result<SqliteStore, AppError> {
    let tmp = std::env::temp_dir().join(format!("lease_migrator_test_{}.db", uuid::Uuid::new_v4()));
    SqliteStore::open_with_pool_size(&tmp, 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SortOrder;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = open_test_store().unwrap();
        store.ping().await.unwrap();

        let id = store
            .insert_one("people", doc(json!({"name": "ada", "age": 36})))
            .await
            .unwrap();
        assert!(!id.is_empty());

        let found = store
            .find_one("people", &Filter::eq("name", "ada"), &FindOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("_id"), Some(&json!(id)));
        assert_eq!(found.get("age"), Some(&json!(36)));

        let missing = store
            .find_one("people", &Filter::eq("name", "bob"), &FindOptions::default())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_duplicate_key_write_error() {
        let store = open_test_store().unwrap();
        store
            .insert_one("locks", doc(json!({"_id": "k", "owner": "a"})))
            .await
            .unwrap();
        let err = store
            .insert_one("locks", doc(json!({"_id": "k", "owner": "b"})))
            .await
            .unwrap_err();
        match err {
            AppError::Write { code, message } => {
                assert_eq!(code, DUPLICATE_KEY_CODE);
                assert!(message.contains("E11000"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sorted_find_with_projection() {
        let store = open_test_store().unwrap();
        for v in [3, 1, 2] {
            store
                .insert_one("ledger", doc(json!({"version": v, "name": format!("m{v}")})))
                .await
                .unwrap();
        }
        let top = store
            .find_one(
                "ledger",
                &Filter::all(),
                &FindOptions::sorted("version", SortOrder::Descending).project(&["version"]),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(top.get("version"), Some(&json!(3)));
        assert!(top.get("name").is_none());
        assert!(top.get("_id").is_some());
    }

    #[tokio::test]
    async fn test_find_one_and_update_images() {
        let store = open_test_store().unwrap();
        store
            .insert_one("locks", doc(json!({"_id": "k", "owner": "a", "leaseUntil": 10})))
            .await
            .unwrap();

        let filter = Filter::And(vec![
            Filter::eq("_id", "k"),
            Filter::Or(vec![
                Filter::lte("leaseUntil", 20),
                Filter::exists("leaseUntil", false),
                Filter::eq("owner", "b"),
            ]),
        ]);
        let update = Update::new().set("owner", "b").set("leaseUntil", 50);

        let before = store
            .find_one_and_update("locks", &filter, &update, ReturnDocument::Before)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.get("owner"), Some(&json!("a")));

        // Now owned by b with lease 50; a conditional on lease <= 20 or owner == c misses.
        let miss = Filter::And(vec![
            Filter::eq("_id", "k"),
            Filter::Or(vec![Filter::lte("leaseUntil", 20), Filter::eq("owner", "c")]),
        ]);
        let none = store
            .find_one_and_update("locks", &miss, &update, ReturnDocument::After)
            .await
            .unwrap();
        assert!(none.is_none());

        let after = store
            .find_one_and_update(
                "locks",
                &Filter::eq("owner", "b"),
                &Update::new().unset("owner").set("leaseUntil", 0),
                ReturnDocument::After,
            )
            .await
            .unwrap()
            .unwrap();
        assert!(after.get("owner").is_none());
        assert_eq!(after.get("leaseUntil"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_update_one_reports_match_count() {
        let store = open_test_store().unwrap();
        store
            .insert_one("locks", doc(json!({"_id": "k", "owner": "a"})))
            .await
            .unwrap();
        let hit = store
            .update_one("locks", &Filter::eq("owner", "a"), &Update::new().set("n", 1))
            .await
            .unwrap();
        assert_eq!(hit, 1);
        let miss = store
            .update_one("locks", &Filter::eq("owner", "z"), &Update::new().set("n", 2))
            .await
            .unwrap();
        assert_eq!(miss, 0);
    }

    #[tokio::test]
    async fn test_null_filter_matches_missing_and_null() {
        let store = open_test_store().unwrap();
        store.insert_one("users", doc(json!({"email": "a@x"}))).await.unwrap();
        store.insert_one("users", doc(json!({"email": null}))).await.unwrap();
        store.insert_one("users", doc(json!({"other": 1}))).await.unwrap();

        let n = store
            .count_documents("users", &Filter::eq("email", Value::Null))
            .await
            .unwrap();
        assert_eq!(n, 2);
        let strings = store
            .count_documents("users", &Filter::IsString("email".into()))
            .await
            .unwrap();
        assert_eq!(strings, 1);
    }

    #[tokio::test]
    async fn test_unique_index_enforced_and_idempotent() {
        let store = open_test_store().unwrap();
        let spec = IndexSpec::unique("uniq_version", "version");
        store.create_index("ledger", &spec).await.unwrap();
        store.create_index("ledger", &spec).await.unwrap();

        store.insert_one("ledger", doc(json!({"version": 1}))).await.unwrap();
        let err = store
            .insert_one("ledger", doc(json!({"version": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Write { code: DUPLICATE_KEY_CODE, .. }));

        let indexes = store.list_indexes("ledger").await.unwrap();
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[1].name, "uniq_version");
        assert!(indexes[1].unique);
    }

    #[tokio::test]
    async fn test_index_name_conflict_is_command_error() {
        let store = open_test_store().unwrap();
        store
            .create_index("ledger", &IndexSpec::unique("idx", "version"))
            .await
            .unwrap();
        let err = store
            .create_index("ledger", &IndexSpec::unique("idx", "name"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Command { code: INDEX_KEY_SPECS_CONFLICT_CODE, .. }
        ));
    }

    #[tokio::test]
    async fn test_unique_index_over_duplicates_fails_with_duplicate_key() {
        let store = open_test_store().unwrap();
        store.insert_one("users", doc(json!({"email": "a@x"}))).await.unwrap();
        store.insert_one("users", doc(json!({"email": "a@x"}))).await.unwrap();
        let err = store
            .create_index("users", &IndexSpec::unique("uniq_email", "email"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Command { code: DUPLICATE_KEY_CODE, .. }));
        // Failed build leaves no catalog entry behind
        assert_eq!(store.list_indexes("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_many_stops_at_first_duplicate() {
        let store = open_test_store().unwrap();
        let err = store
            .insert_many(
                "things",
                vec![
                    doc(json!({"_id": "a"})),
                    doc(json!({"_id": "b"})),
                    doc(json!({"_id": "a"})),
                    doc(json!({"_id": "c"})),
                ],
            )
            .await
            .unwrap_err();
        match err {
            AppError::BulkWrite(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 2);
                assert_eq!(failures[0].code, DUPLICATE_KEY_CODE);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.count_documents("things", &Filter::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_string_values() {
        let store = open_test_store().unwrap();
        for email in ["a@x", "a@x", "b@x", "c@x", "c@x", "c@x"] {
            store.insert_one("users", doc(json!({"email": email}))).await.unwrap();
        }
        store.insert_one("users", doc(json!({"email": 7}))).await.unwrap();
        store.insert_one("users", doc(json!({"email": 7}))).await.unwrap();

        let dups = store.duplicate_string_values("users", "email", 10).await.unwrap();
        assert_eq!(
            dups,
            vec![
                DuplicateValue { value: "c@x".into(), count: 3 },
                DuplicateValue { value: "a@x".into(), count: 2 },
            ]
        );
        let limited = store.duplicate_string_values("users", "email", 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        // Limits beyond i64 saturate instead of wrapping.
        let unbounded = store
            .duplicate_string_values("users", "email", usize::MAX)
            .await
            .unwrap();
        assert_eq!(unbounded, dups);
    }

    async fn table_count(store: &SqliteStore, name: &str) -> i64 {
        let name = name.to_string();
        store
            .with_conn(None, move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [&name],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reads_do_not_create_collections() {
        let store = open_test_store().unwrap();
        let any = Filter::all();

        assert_eq!(store.count_documents("ghost", &any).await.unwrap(), 0);
        assert!(store.find_one("ghost", &any, &FindOptions::default()).await.unwrap().is_none());
        assert!(store.duplicate_string_values("ghost", "email", 10).await.unwrap().is_empty());
        assert_eq!(
            store.update_one("ghost", &any, &Update::new().set("n", 1)).await.unwrap(),
            0
        );
        assert!(store
            .find_one_and_update("ghost", &any, &Update::new().set("n", 1), ReturnDocument::After)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.list_indexes("ghost").await.unwrap().len(), 1);

        assert_eq!(table_count(&store, "ghost").await, 0);

        // The first insert creates it.
        store.insert_one("ghost", doc(json!({"n": 1}))).await.unwrap();
        assert_eq!(table_count(&store, "ghost").await, 1);
        assert_eq!(store.count_documents("ghost", &any).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_unsafe_names() {
        let store = open_test_store().unwrap();
        let err = store
            .count_documents("bad name", &Filter::all())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = store
            .count_documents("ok", &Filter::eq("a'b", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_two_handles_share_one_file() {
        let a = open_test_store().unwrap();
        let b = SqliteStore::open(a.path()).unwrap();
        a.insert_one("shared", doc(json!({"_id": "x"}))).await.unwrap();
        assert_eq!(b.count_documents("shared", &Filter::all()).await.unwrap(), 1);
    }
}
