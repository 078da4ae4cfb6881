//! Error classification and index diagnostics shared by the manager and by
//! migration bodies.

use serde_json::Value;

use crate::db::{DocumentDb, DuplicateValue, Filter, IndexInfo};
use crate::error::{AppError, DUPLICATE_KEY_CODE};

/// Whether `err` reports a unique-index violation.
///
/// Looks at single-write, bulk-write and command errors by code, raw SQLite
/// constraint failures, and finally falls back to the `E11000` marker in the
/// message text.
pub fn is_duplicate_key_error(err: &AppError) -> bool {
    match err {
        AppError::Write { code, .. } | AppError::Command { code, .. } if *code == DUPLICATE_KEY_CODE => true,
        AppError::BulkWrite(failures) if failures.iter().any(|f| f.code == DUPLICATE_KEY_CODE) => true,
        AppError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            true
        }
        other => other.to_string().contains("E11000"),
    }
}

pub async fn list_indexes(db: &dyn DocumentDb, collection: &str) -> Result<Vec<IndexInfo>, AppError> {
    db.list_indexes(collection).await
}

/// True when `key` is exactly `{field: direction}`. Integer and float
/// encodings of the direction are all accepted.
pub fn single_field_index_key_equals(key: &[(String, Value)], field: &str, direction: i32) -> bool {
    let [(name, value)] = key else {
        return false;
    };
    if name != field {
        return false;
    }
    if let Some(i) = value.as_i64() {
        return i == direction as i64;
    }
    match value.as_f64() {
        Some(f) => f as i32 == direction,
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Absent,
    Unique,
    NonUnique,
}

/// Classify the index on `{field: direction}`.
///
/// An index named `desired_name` with some other key is an error. Otherwise
/// the first index with the wanted key decides the state, and its name is
/// returned alongside.
pub fn single_field_index_state(
    indexes: &[IndexInfo],
    field: &str,
    direction: i32,
    desired_name: &str,
) -> Result<(IndexState, Option<String>), AppError> {
    for idx in indexes {
        let matches_key = single_field_index_key_equals(&idx.key, field, direction);

        if idx.name == desired_name && !matches_key {
            return Err(AppError::Validation(format!(
                "index name {:?} exists but key is {} (expected {{{field}: {direction}}})",
                desired_name,
                format_key(&idx.key)
            )));
        }

        if matches_key {
            let state = if idx.unique {
                IndexState::Unique
            } else {
                IndexState::NonUnique
            };
            return Ok((state, Some(idx.name.clone())));
        }
    }

    Ok((IndexState::Absent, None))
}

fn format_key(key: &[(String, Value)]) -> String {
    let parts: Vec<String> = key.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    format!("{{{}}}", parts.join(", "))
}

/// What stands in the way of a unique index on a string field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqueStringFieldDiagnostics {
    pub duplicate_strings: Vec<DuplicateValue>,
    pub null_count: u64,
}

/// Report up to `limit` duplicated string values of `field` and how many
/// documents have it null or missing.
pub async fn diagnose_unique_string_field(
    db: &dyn DocumentDb,
    collection: &str,
    field: &str,
    limit: usize,
) -> Result<UniqueStringFieldDiagnostics, AppError> {
    let duplicate_strings = db.duplicate_string_values(collection, field, limit).await?;
    let null_count = db
        .count_documents(collection, &Filter::Eq(field.to_string(), Value::Null))
        .await?;

    Ok(UniqueStringFieldDiagnostics {
        duplicate_strings,
        null_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_test_store;
    use crate::db::IndexSpec;
    use crate::error::WriteFailure;
    use serde_json::json;

    fn key(field: &str, dir: Value) -> Vec<(String, Value)> {
        vec![(field.to_string(), dir)]
    }

    #[test]
    fn test_duplicate_key_by_code() {
        assert!(is_duplicate_key_error(&AppError::Write {
            code: DUPLICATE_KEY_CODE,
            message: "x".into()
        }));
        assert!(is_duplicate_key_error(&AppError::Command {
            code: DUPLICATE_KEY_CODE,
            message: "x".into()
        }));
        assert!(is_duplicate_key_error(&AppError::BulkWrite(vec![
            WriteFailure { index: 0, code: 2, message: "bad".into() },
            WriteFailure { index: 1, code: DUPLICATE_KEY_CODE, message: "dup".into() },
        ])));
    }

    #[test]
    fn test_duplicate_key_negative_and_fallback() {
        assert!(!is_duplicate_key_error(&AppError::Write {
            code: 2,
            message: "bad value".into()
        }));
        assert!(!is_duplicate_key_error(&AppError::BulkWrite(vec![WriteFailure {
            index: 0,
            code: 2,
            message: "bad".into()
        }])));
        assert!(!is_duplicate_key_error(&AppError::Timeout("insert".into())));
        assert!(is_duplicate_key_error(&AppError::Internal(
            "E11000 duplicate key error collection: x".into()
        )));
    }

    #[test]
    fn test_duplicate_key_from_raw_sqlite() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        assert!(is_duplicate_key_error(&AppError::Database(err)));
    }

    #[test]
    fn test_key_equals_accepts_number_encodings() {
        assert!(single_field_index_key_equals(&key("version", json!(1)), "version", 1));
        assert!(single_field_index_key_equals(&key("version", json!(1.0)), "version", 1));
        assert!(single_field_index_key_equals(&key("version", json!(-1)), "version", -1));
        assert!(!single_field_index_key_equals(&key("version", json!(-1)), "version", 1));
        assert!(!single_field_index_key_equals(&key("version", json!("1")), "version", 1));
        assert!(!single_field_index_key_equals(&key("name", json!(1)), "version", 1));

        let compound = vec![
            ("version".to_string(), json!(1)),
            ("name".to_string(), json!(1)),
        ];
        assert!(!single_field_index_key_equals(&compound, "version", 1));
        assert!(!single_field_index_key_equals(&[], "version", 1));
    }

    #[test]
    fn test_index_state() {
        let indexes = vec![
            IndexInfo { name: "_id_".into(), key: key("_id", json!(1)), unique: true },
            IndexInfo { name: "email_1".into(), key: key("email", json!(1)), unique: false },
            IndexInfo { name: "uniq_version".into(), key: key("version", json!(1)), unique: true },
        ];

        assert_eq!(
            single_field_index_state(&indexes, "version", 1, "uniq_version").unwrap(),
            (IndexState::Unique, Some("uniq_version".into()))
        );
        assert_eq!(
            single_field_index_state(&indexes, "email", 1, "uniq_email").unwrap(),
            (IndexState::NonUnique, Some("email_1".into()))
        );
        assert_eq!(
            single_field_index_state(&indexes, "slug", 1, "uniq_slug").unwrap(),
            (IndexState::Absent, None)
        );

        let err = single_field_index_state(&indexes, "slug", 1, "email_1").unwrap_err();
        assert!(err.to_string().contains("exists but key is {email: 1}"));
    }

    #[tokio::test]
    async fn test_index_state_against_store() {
        let store = open_test_store().unwrap();
        store
            .create_index("users", &IndexSpec { name: "email_1".into(), field: "email".into(), direction: 1, unique: false })
            .await
            .unwrap();
        let indexes = list_indexes(&store, "users").await.unwrap();
        let (state, name) = single_field_index_state(&indexes, "email", 1, "uniq_email").unwrap();
        assert_eq!(state, IndexState::NonUnique);
        assert_eq!(name.as_deref(), Some("email_1"));
    }

    #[tokio::test]
    async fn test_diagnose_unique_string_field() {
        let store = open_test_store().unwrap();
        for value in [json!("a@x"), json!("a@x"), json!("b@x"), json!(null)] {
            let mut doc = crate::db::Document::new();
            doc.insert("email".into(), value);
            store.insert_one("users", doc).await.unwrap();
        }
        store.insert_one("users", crate::db::Document::new()).await.unwrap();

        let diag = diagnose_unique_string_field(&store, "users", "email", 100).await.unwrap();
        assert_eq!(
            diag.duplicate_strings,
            vec![DuplicateValue { value: "a@x".into(), count: 2 }]
        );
        assert_eq!(diag.null_count, 2);
    }
}
