use rusqlite::{params, Connection, OptionalExtension};

use crate::error::AppError;

/// Table recording the indexes created through the document API.
pub const CATALOG_TABLE: &str = "_catalog_indexes";

/// Create the catalog table. Idempotent.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Ensuring index catalog");
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _catalog_indexes (
    collection  TEXT NOT NULL,
    name        TEXT NOT NULL,
    field       TEXT NOT NULL,
    direction   INTEGER NOT NULL,
    is_unique   INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (collection, name)
);
"#;

/// A catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub field: String,
    pub direction: i32,
    pub unique: bool,
}

pub fn get(conn: &Connection, collection: &str, name: &str) -> Result<Option<CatalogEntry>, AppError> {
    let entry = conn
        .query_row(
            "SELECT name, field, direction, is_unique FROM _catalog_indexes
             WHERE collection = ?1 AND name = ?2",
            params![collection, name],
            row_to_entry,
        )
        .optional()?;
    Ok(entry)
}

/// Find an index on `collection` keyed by exactly `field`/`direction`.
pub fn find_by_key(
    conn: &Connection,
    collection: &str,
    field: &str,
    direction: i32,
) -> Result<Option<CatalogEntry>, AppError> {
    let entry = conn
        .query_row(
            "SELECT name, field, direction, is_unique FROM _catalog_indexes
             WHERE collection = ?1 AND field = ?2 AND direction = ?3",
            params![collection, field, direction],
            row_to_entry,
        )
        .optional()?;
    Ok(entry)
}

pub fn list(conn: &Connection, collection: &str) -> Result<Vec<CatalogEntry>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT name, field, direction, is_unique FROM _catalog_indexes
         WHERE collection = ?1 ORDER BY created_at, name",
    )?;
    let rows = stmt.query_map(params![collection], row_to_entry)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert(conn: &Connection, collection: &str, entry: &CatalogEntry) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO _catalog_indexes (collection, name, field, direction, is_unique, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            collection,
            entry.name,
            entry.field,
            entry.direction,
            entry.unique as i64,
            now
        ],
    )?;
    Ok(())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogEntry> {
    Ok(CatalogEntry {
        name: row.get(0)?,
        field: row.get(1)?,
        direction: row.get(2)?,
        unique: row.get::<_, i64>(3)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        // Running twice is harmless
        run(&conn).unwrap();

        assert_eq!(get(&conn, "users", "uniq_email").unwrap(), None);

        let entry = CatalogEntry {
            name: "uniq_email".into(),
            field: "email".into(),
            direction: 1,
            unique: true,
        };
        insert(&conn, "users", &entry).unwrap();

        assert_eq!(get(&conn, "users", "uniq_email").unwrap(), Some(entry.clone()));
        assert_eq!(find_by_key(&conn, "users", "email", 1).unwrap(), Some(entry.clone()));
        assert_eq!(find_by_key(&conn, "users", "email", -1).unwrap(), None);
        assert_eq!(list(&conn, "users").unwrap(), vec![entry]);
        assert!(list(&conn, "orders").unwrap().is_empty());
    }
}
