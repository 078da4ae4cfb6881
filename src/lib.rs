//! Lease-locked, exactly-once migrations for replicas that share one
//! document database.
//!
//! Build a [`Manager`] per process with a unique owner id, call
//! [`Manager::run`] once at startup, and gate traffic on
//! [`readiness::Readiness`].

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod migrator;
pub mod readiness;
pub mod validation;

pub use config::MigratorConfig;
pub use db::sqlite::SqliteStore;
pub use db::{DocumentDb, SharedDb};
pub use error::AppError;
pub use migrator::{ApplyContext, Manager, Migration};
pub use readiness::{gate_check, Readiness};
