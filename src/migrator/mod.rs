//! Lease-locked migration runner.
//!
//! [`Manager::run`] validates an ordered migration set, elects a single
//! leader through [`Locker`], and applies pending migrations exactly once
//! while the leader keeps its lease renewed in the background.

pub mod helpers;
pub mod lock;
pub mod manager;
pub mod types;


pub use helpers::{
    diagnose_unique_string_field, is_duplicate_key_error, list_indexes, single_field_index_key_equals,
    single_field_index_state, IndexState, UniqueStringFieldDiagnostics,
};
pub use lock::{AcquireInfo, LockDoc, Locker, LOCKS_COLLECTION};
pub use manager::{
    default_owner_id, owner_id_from_host, Manager, MigrationRecord, MIGRATIONS_COLLECTION, VERSION_INDEX_NAME,
};
pub use types::{target_version, validate_and_sort, ApplyContext, ApplyFn, Migration};
