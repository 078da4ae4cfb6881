/// Conventional document-store error code for a unique-index violation.
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Document-store error code for an index that exists with different options.
pub const INDEX_OPTIONS_CONFLICT_CODE: i32 = 85;

/// Document-store error code for an index whose name is taken by a different key.
pub const INDEX_KEY_SPECS_CONFLICT_CODE: i32 = 86;

/// One failed document inside a multi-document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub index: usize,
    pub code: i32,
    pub message: String,
}

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Write error {code}: {message}")]
    Write { code: i32, message: String },

    #[error("Bulk write error: {}", summarize_failures(.0))]
    BulkWrite(Vec<WriteFailure>),

    #[error("Command error {code}: {message}")]
    Command { code: i32, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Migration {version} ({name}) failed: {message}")]
    Apply {
        version: i64,
        name: String,
        message: String,
    },

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable tag for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::Serde(_) => "serde",
            AppError::Io(_) => "io",
            AppError::Validation(_) => "validation",
            AppError::Write { .. } => "write",
            AppError::BulkWrite(_) => "bulk_write",
            AppError::Command { .. } => "command",
            AppError::Timeout(_) => "timeout",
            AppError::Cancelled => "cancelled",
            AppError::LeaseLost(_) => "lease_lost",
            AppError::Apply { .. } => "apply",
            AppError::Unavailable(_) => "unavailable",
            AppError::Internal(_) => "internal",
        }
    }
}

fn summarize_failures(failures: &[WriteFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}: {}", f.index, f.code, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
