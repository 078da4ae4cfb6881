use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::db::SharedDb;
use crate::error::AppError;

/// What a migration body receives: the database and the token of the run
/// it belongs to. The body is already bounded by the migration timeout.
#[derive(Clone)]
pub struct ApplyContext {
    pub db: SharedDb,
    pub cancel: CancellationToken,
}

pub type ApplyFn = Arc<dyn Fn(ApplyContext) -> BoxFuture<'static, Result<(), AppError>> + Send + Sync>;

/// One ordered, one-shot migration.
#[derive(Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    /// `None` is rejected by [`validate_and_sort`].
    pub apply: Option<ApplyFn>,
}

impl Migration {
    pub fn new<F, Fut>(version: i64, name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(ApplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let apply: ApplyFn = Arc::new(
            move |ctx: ApplyContext| -> BoxFuture<'static, Result<(), AppError>> { Box::pin(apply(ctx)) },
        );
        Self {
            version,
            name: name.into(),
            apply: Some(apply),
        }
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("apply", &self.apply.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Check every migration and return references to them in ascending version
/// order. Checks run per migration in input order: version, name, apply,
/// then uniqueness.
pub fn validate_and_sort(list: &[Migration]) -> Result<Vec<&Migration>, AppError> {
    let mut seen = HashSet::with_capacity(list.len());

    for m in list {
        if m.version <= 0 {
            return Err(AppError::Validation(format!(
                "migration version must be > 0, got {} ({})",
                m.version, m.name
            )));
        }
        if m.name.is_empty() {
            return Err(AppError::Validation(format!(
                "migration name is empty for version {}",
                m.version
            )));
        }
        if m.apply.is_none() {
            return Err(AppError::Validation(format!(
                "migration apply function is missing for version {} ({})",
                m.version, m.name
            )));
        }
        if !seen.insert(m.version) {
            return Err(AppError::Validation(format!(
                "duplicate migration version {}",
                m.version
            )));
        }
    }

    let mut sorted: Vec<&Migration> = list.iter().collect();
    sorted.sort_by_key(|m| m.version);
    Ok(sorted)
}

/// Highest version in the set, `0` when empty.
pub fn target_version<M: Borrow<Migration>>(list: &[M]) -> i64 {
    list.iter().map(|m| m.borrow().version).max().unwrap_or(0)
}
