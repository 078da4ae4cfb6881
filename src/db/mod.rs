//! Document-database capability.
//!
//! The migrator never talks to a concrete driver. It calls the [`DocumentDb`]
//! trait, which models the handful of single-document primitives the lock and
//! the migration ledger need: conditional find-and-update with a chosen image,
//! insert with duplicate-key reporting, sorted single-document reads and
//! counts, plus index management. [`sqlite::SqliteStore`] is the bundled
//! implementation.

pub mod catalog;
pub mod readiness;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AppError;

/// A JSON document. `_id` is the primary key of its collection.
pub type Document = serde_json::Map<String, Value>;

/// Name of the primary-key field.
pub const ID_FIELD: &str = "_id";

pub type SharedDb = Arc<dyn DocumentDb>;

// ── Queries ────────────────────────────────────────────────────────

/// Predicate over the documents of one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals value. `Eq(field, Null)` also matches a missing field.
    Eq(String, Value),
    /// Field is present and `<=` value.
    Lte(String, Value),
    /// Field presence (`true`) or absence (`false`).
    Exists(String, bool),
    /// Field holds a string.
    IsString(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lte(field.to_string(), value.into())
    }

    pub fn exists(field: &str, present: bool) -> Self {
        Filter::Exists(field.to_string(), present)
    }
}

/// `$set` / `$unset` style modification of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn unset(mut self, field: &str) -> Self {
        self.unset.push(field.to_string());
        self
    }
}

/// Which image `find_one_and_update` hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    /// Fields to keep besides `_id`. `None` returns the whole document.
    pub projection: Option<Vec<String>>,
}

impl FindOptions {
    pub fn sorted(field: &str, order: SortOrder) -> Self {
        Self {
            sort: Some((field.to_string(), order)),
            projection: None,
        }
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }
}

// ── Indexes ────────────────────────────────────────────────────────

/// Single-field index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub field: String,
    /// `1` ascending, `-1` descending.
    pub direction: i32,
    pub unique: bool,
}

impl IndexSpec {
    pub fn unique(name: &str, field: &str) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            direction: 1,
            unique: true,
        }
    }
}

/// An index as reported by [`DocumentDb::list_indexes`]. Key directions are
/// raw JSON numbers since drivers disagree on their integer width.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub key: Vec<(String, Value)>,
    pub unique: bool,
}

/// A string value held by more than one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateValue {
    pub value: String,
    pub count: u64,
}

// ── Capability ─────────────────────────────────────────────────────

/// The database operations the migrator and migration bodies rely on.
///
/// Every write touches exactly one document atomically; nothing here needs a
/// multi-document transaction. Duplicate-key conditions surface as
/// [`AppError::Write`], [`AppError::BulkWrite`] or [`AppError::Command`]
/// carrying [`crate::error::DUPLICATE_KEY_CODE`].
#[async_trait]
pub trait DocumentDb: Send + Sync {
    async fn ping(&self) -> Result<(), AppError>;

    /// Create a single-field index. Re-creating an identical index is a no-op.
    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<(), AppError>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, AppError>;

    /// Atomically apply `update` to the first document matching `filter`.
    /// Returns `None` when nothing matched.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        returning: ReturnDocument,
    ) -> Result<Option<Document>, AppError>;

    /// Apply `update` to the first matching document; returns the match count.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, AppError>;

    /// Insert one document, generating `_id` when absent. Returns the id.
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String, AppError>;

    /// Ordered multi-insert: stops at the first failing document.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<String>, AppError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Option<Document>, AppError>;

    async fn count_documents(&self, collection: &str, filter: &Filter) -> Result<u64, AppError>;

    /// String values of `field` shared by more than one document, at most `limit`.
    async fn duplicate_string_values(
        &self,
        collection: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<DuplicateValue>, AppError>;
}
