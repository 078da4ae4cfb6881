use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use lease_migrator::config::ServiceSettings;
use lease_migrator::db::readiness::DbReadiness;
use lease_migrator::db::{Filter, IndexSpec};
use lease_migrator::migrator::{
    diagnose_unique_string_field, is_duplicate_key_error, list_indexes, owner_id_from_host,
    single_field_index_state, IndexState,
};
use lease_migrator::{gate_check, logging, AppError, Manager, Migration, MigratorConfig, SharedDb, SqliteStore};

const USERS: &str = "users";

fn demo_migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "users-unique-email", |ctx| async move {
            let diag = diagnose_unique_string_field(ctx.db.as_ref(), USERS, "email", 20).await?;
            if !diag.duplicate_strings.is_empty() {
                return Err(AppError::Validation(format!(
                    "cannot build unique email index: {} duplicated values (first {:?})",
                    diag.duplicate_strings.len(),
                    diag.duplicate_strings[0].value
                )));
            }
            if diag.null_count > 1 {
                tracing::warn!(null_count = diag.null_count, "Users without email block a unique index");
            }

            let indexes = list_indexes(ctx.db.as_ref(), USERS).await?;
            match single_field_index_state(&indexes, "email", 1, "uniq_email")? {
                (IndexState::Unique, _) => Ok(()),
                (IndexState::NonUnique, Some(name)) => Err(AppError::Validation(format!(
                    "non-unique index {name:?} already covers email"
                ))),
                _ => ctx.db.create_index(USERS, &IndexSpec::unique("uniq_email", "email")).await,
            }
        }),
        Migration::new(2, "seed-admin", |ctx| async move {
            if ctx.db.count_documents(USERS, &Filter::eq("role", "admin")).await? > 0 {
                return Ok(());
            }
            let serde_json::Value::Object(admin) = json!({"email": "admin@localhost", "role": "admin"}) else {
                return Err(AppError::Internal("admin seed is not an object".into()));
            };
            match ctx.db.insert_one(USERS, admin).await {
                Ok(_) => Ok(()),
                Err(e) if is_duplicate_key_error(&e) => Ok(()),
                Err(e) => Err(e),
            }
        }),
    ]
}

async fn run() -> Result<(), AppError> {
    let cfg = MigratorConfig::from_env()?;
    let settings = ServiceSettings::from_env();
    let owner = settings.owner_id.unwrap_or_else(owner_id_from_host);

    let db: SharedDb = Arc::new(SqliteStore::open(&settings.db_path)?);
    tracing::info!(path = %settings.db_path.display(), owner = %owner, lock_key = %cfg.lock_key, "Opened database");

    let ctx = CancellationToken::new();
    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, cancelling");
                ctx.cancel();
            }
        }
    });

    let health = Arc::new(DbReadiness::new(db.clone(), cfg.op_timeout));
    let monitor = tokio::spawn({
        let health = health.clone();
        let ctx = ctx.clone();
        async move { health.run(ctx, Duration::from_secs(5)).await }
    });

    let manager = Manager::new(db, &owner, cfg);
    manager.run(&ctx, &demo_migrations()).await?;

    match gate_check(&manager, "/users.v1.Users/List") {
        Ok(()) => tracing::info!("Migrations ready, serving traffic"),
        Err(e) => tracing::warn!(error = %e, "Migrations not ready, requests will be rejected"),
    }
    if let Err(e) = gate_check(health.as_ref(), "/users.v1.Users/List") {
        tracing::warn!(error = %e, "Database gate closed");
    }

    ctx.cancel();
    let _ = monitor.await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    logging::init();

    tracing::info!("Starting lease-migrator v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run().await {
        tracing::error!(kind = e.kind(), error = %e, "Startup failed");
        std::process::exit(1);
    }
}
