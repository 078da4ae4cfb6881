use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::MigratorConfig;
use crate::db::{Filter, FindOptions, IndexSpec, SharedDb, SortOrder};
use crate::error::AppError;
use crate::migrator::helpers::is_duplicate_key_error;
use crate::migrator::lock::Locker;
use crate::migrator::types::{target_version, validate_and_sort, ApplyContext, Migration};

/// Collection holding one record per applied migration.
pub const MIGRATIONS_COLLECTION: &str = "__migrations";

/// Unique index on `version` in [`MIGRATIONS_COLLECTION`].
pub const VERSION_INDEX_NAME: &str = "uniq_version";

/// Ledger entry written after a migration body succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub applied_at: DateTime<Utc>,
}

/// `hostname-<16 hex chars>`, unique per process instance.
pub fn default_owner_id(hostname: &str) -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{hostname}-{}", hex::encode(bytes))
}

/// [`default_owner_id`] for this machine's hostname.
pub fn owner_id_from_host() -> String {
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "unknown-host".to_string());
    default_owner_id(&host)
}

/// Await `fut` for at most `limit`, giving up early if `ctx` is cancelled.
async fn bounded<T, F>(ctx: &CancellationToken, limit: Duration, label: &str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(AppError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(format!("{label} after {limit:?}"))),
        },
    }
}

/// Coordinates one migration run across replicas sharing a database.
///
/// Exactly one replica (the lease holder) applies pending migrations; the
/// rest either return immediately not-ready or poll until the target version
/// shows up, taking over if the holder's lease lapses. [`Manager::ready`] and
/// [`Manager::last_error`] stay readable from other tasks for the life of the
/// process and latch whatever state `run` leaves behind.
pub struct Manager {
    db: SharedDb,
    locker: Arc<Locker>,
    cfg: MigratorConfig,
    ready: AtomicBool,
    last_error: RwLock<String>,
}

impl Manager {
    pub fn new(db: SharedDb, owner: &str, cfg: MigratorConfig) -> Self {
        let cfg = cfg.normalized();
        let locker = Arc::new(Locker::new(db.clone(), &cfg.lock_key, owner, cfg.lease_for));
        Self {
            db,
            locker,
            cfg,
            ready: AtomicBool::new(false),
            last_error: RwLock::new(String::new()),
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> String {
        self.last_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn owner(&self) -> &str {
        self.locker.owner()
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.cfg
    }

    fn set_error(&self, err: Option<&AppError>) {
        let mut slot = self.last_error.write().unwrap_or_else(|e| e.into_inner());
        *slot = err.map(ToString::to_string).unwrap_or_default();
    }

    fn mark_ready(&self) {
        self.set_error(None);
        self.ready.store(true, Ordering::Release);
    }

    /// Latch `err`; hand it back only in fail-fast mode.
    fn fail(&self, err: AppError, what: &str) -> Result<(), AppError> {
        self.set_error(Some(&err));
        tracing::error!(
            lock_key = %self.cfg.lock_key,
            owner = %self.locker.owner(),
            kind = err.kind(),
            error = %err,
            "Migrations: {what}"
        );
        if self.cfg.fail_fast {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Bring the database up to the highest version in `migrations`.
    ///
    /// Without `fail_fast` every failure is latched into `last_error` and
    /// `Ok(())` is returned with the manager left not-ready. Call once.
    pub async fn run(&self, ctx: &CancellationToken, migrations: &[Migration]) -> Result<(), AppError> {
        let sorted = match validate_and_sort(migrations) {
            Ok(sorted) => sorted,
            Err(e) => return self.fail(e, "invalid migration list"),
        };

        let target = target_version(&sorted);
        if target == 0 {
            self.mark_ready();
            return Ok(());
        }

        if let Err(e) = self.ensure_internal_indexes(ctx).await {
            return self.fail(e, "ensure internal indexes failed");
        }

        // Nothing pending: skip the lock entirely.
        let applied = match self.applied_version(ctx).await {
            Ok(applied) if applied >= target => {
                tracing::debug!(target, applied, "Migrations: already at target");
                self.mark_ready();
                return Ok(());
            }
            Ok(applied) => applied,
            Err(e) => {
                tracing::debug!(error = %e, "Migrations: applied version unknown, trying lock");
                0
            }
        };

        tracing::debug!(target, applied, owner = %self.locker.owner(), "Migrations: starting");

        let acquired = match self.try_acquire(ctx).await {
            Ok(acquired) => acquired,
            Err(e) => return self.fail(e, "lock acquire error"),
        };

        if acquired {
            return match self.run_as_leader(ctx, &sorted).await {
                Ok(()) => {
                    self.mark_ready();
                    tracing::info!(target, "Migrations: done");
                    Ok(())
                }
                Err(e) => self.fail(e, "failed"),
            };
        }

        if !self.cfg.wait_for_leader {
            tracing::debug!("Migrations: not leader, not waiting for target");
            return Ok(());
        }

        match self.wait_for_target(ctx, target, &sorted).await {
            Ok(()) => {
                self.mark_ready();
                tracing::debug!(target, "Migrations: target reached");
                Ok(())
            }
            Err(e) => self.fail(e, "wait for target failed"),
        }
    }

    async fn try_acquire(&self, ctx: &CancellationToken) -> Result<bool, AppError> {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return bounded(ctx, self.cfg.op_timeout, "lock acquire", self.locker.try_acquire()).await;
        }

        let info = bounded(
            ctx,
            self.cfg.op_timeout,
            "lock acquire",
            self.locker.try_acquire_with_info(),
        )
        .await?;

        if info.acquired && info.takeover {
            tracing::debug!(
                lock_key = %self.cfg.lock_key,
                new_owner = ?info.new_owner,
                new_lease_until = ?info.new_lease_until,
                prev_owner = ?info.prev_owner,
                prev_lease_until = ?info.prev_lease_until,
                "Migrations: lock takeover"
            );
        } else if info.acquired && info.created {
            tracing::debug!(
                lock_key = %self.cfg.lock_key,
                new_owner = ?info.new_owner,
                new_lease_until = ?info.new_lease_until,
                "Migrations: lock created"
            );
        }

        Ok(info.acquired)
    }

    /// Apply pending migrations while a background task keeps the lease alive.
    async fn run_as_leader(&self, ctx: &CancellationToken, list: &[&Migration]) -> Result<(), AppError> {
        let leader = ctx.child_token();
        let renewal = tokio::spawn(renew_loop(
            self.locker.clone(),
            leader.clone(),
            (self.cfg.lease_for / 2).max(Duration::from_millis(1)),
            self.cfg.op_timeout,
        ));

        let outcome = self.apply_pending(ctx, &leader, list).await;

        leader.cancel();
        let renewed = renewal
            .await
            .unwrap_or_else(|e| Err(AppError::Internal(format!("lease renewal task failed: {e}"))));

        // Best effort, and never bounded by a token that may already be cancelled.
        match tokio::time::timeout(self.cfg.op_timeout, self.locker.release()).await {
            Ok(Ok(())) => tracing::debug!(lock_key = %self.cfg.lock_key, "Migrations: lock released"),
            Ok(Err(e)) => tracing::debug!(error = %e, "Migrations: lock release failed"),
            Err(_) => tracing::debug!("Migrations: lock release timed out"),
        }

        match (outcome, renewed) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()) | Err(AppError::Cancelled), Err(lost)) => Err(lost),
            (Err(e), _) => Err(e),
        }
    }

    /// The sequential part of leadership. Stops before the next migration once
    /// `leader` is cancelled; an apply already in flight runs to completion or
    /// to the migration timeout.
    async fn apply_pending(
        &self,
        ctx: &CancellationToken,
        leader: &CancellationToken,
        list: &[&Migration],
    ) -> Result<(), AppError> {
        for mig in list {
            if leader.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            if self.is_applied(ctx, mig.version).await? {
                tracing::debug!(version = mig.version, name = %mig.name, "Migrations: already applied");
                continue;
            }

            let Some(apply) = mig.apply.as_ref() else {
                return Err(AppError::Validation(format!(
                    "migration apply function is missing for version {} ({})",
                    mig.version, mig.name
                )));
            };

            tracing::debug!(version = mig.version, name = %mig.name, "Migrations: applying");

            let apply_ctx = ApplyContext {
                db: self.db.clone(),
                cancel: leader.clone(),
            };
            match tokio::time::timeout(self.cfg.migration_timeout, apply(apply_ctx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(AppError::Apply {
                        version: mig.version,
                        name: mig.name.clone(),
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(AppError::Timeout(format!(
                        "migration {} ({}) after {:?}",
                        mig.version, mig.name, self.cfg.migration_timeout
                    )));
                }
            }

            // Recorded against the outer token: the body has already run, so the
            // record should land even if the lease was lost meanwhile.
            match self.record_applied(ctx, mig).await {
                Ok(()) => tracing::info!(version = mig.version, name = %mig.name, "Migrations: applied"),
                Err(e) if is_duplicate_key_error(&e) => {
                    tracing::debug!(version = mig.version, "Migrations: already recorded by another leader");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Follower loop: poll for the target version, taking over the lock if it
    /// becomes free.
    async fn wait_for_target(
        &self,
        ctx: &CancellationToken,
        target: i64,
        sorted: &[&Migration],
    ) -> Result<(), AppError> {
        let every = self.cfg.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(AppError::Cancelled),
                _ = ticker.tick() => {}
            }

            match self.applied_version(ctx).await {
                Ok(applied) if applied >= target => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "Migrations: poll read failed");
                    continue;
                }
            }

            match self.try_acquire(ctx).await {
                Ok(true) => {
                    tracing::debug!(owner = %self.locker.owner(), "Migrations: lock acquired by follower (leader takeover)");
                    return self.run_as_leader(ctx, sorted).await;
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "Migrations: poll acquire failed"),
            }
        }
    }

    async fn ensure_internal_indexes(&self, ctx: &CancellationToken) -> Result<(), AppError> {
        let spec = IndexSpec::unique(VERSION_INDEX_NAME, "version");
        bounded(
            ctx,
            self.cfg.op_timeout,
            "ensure version index",
            self.db.create_index(MIGRATIONS_COLLECTION, &spec),
        )
        .await
    }

    /// Highest recorded version, `0` when none.
    pub async fn applied_version(&self, ctx: &CancellationToken) -> Result<i64, AppError> {
        let options = FindOptions::sorted("version", SortOrder::Descending).project(&["version"]);
        let top = bounded(
            ctx,
            self.cfg.op_timeout,
            "read applied version",
            self.db.find_one(MIGRATIONS_COLLECTION, &Filter::all(), &options),
        )
        .await?;

        Ok(top
            .and_then(|doc| doc.get("version").and_then(Value::as_i64))
            .unwrap_or(0))
    }

    async fn is_applied(&self, ctx: &CancellationToken, version: i64) -> Result<bool, AppError> {
        let n = bounded(
            ctx,
            self.cfg.op_timeout,
            "check applied",
            self.db
                .count_documents(MIGRATIONS_COLLECTION, &Filter::eq("version", version)),
        )
        .await?;
        Ok(n > 0)
    }

    async fn record_applied(&self, ctx: &CancellationToken, mig: &Migration) -> Result<(), AppError> {
        let record = MigrationRecord {
            version: mig.version,
            name: mig.name.clone(),
            applied_at: Utc::now(),
        };
        let Value::Object(doc) = serde_json::to_value(&record)? else {
            return Err(AppError::Internal("migration record did not serialize to an object".into()));
        };
        bounded(
            ctx,
            self.cfg.op_timeout,
            "record migration",
            self.db.insert_one(MIGRATIONS_COLLECTION, doc),
        )
        .await?;
        Ok(())
    }
}

/// Renew every `every` until `leader` is cancelled. A failed renewal cancels
/// `leader` and becomes the result.
async fn renew_loop(
    locker: Arc<Locker>,
    leader: CancellationToken,
    every: Duration,
    op_timeout: Duration,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = leader.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        match bounded(&leader, op_timeout, "lock renew", locker.renew()).await {
            Ok(()) => {}
            Err(AppError::Cancelled) => return Ok(()),
            Err(e) => {
                tracing::warn!(lock_key = %locker.lock_key(), error = %e, "Migrations: lease renewal failed");
                leader.cancel();
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_owner_id_shape() {
        let a = default_owner_id("host-1");
        let b = default_owner_id("host-1");
        assert!(a.starts_with("host-1-"));
        let suffix = &a["host-1-".len()..];
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_owner_id_from_host_is_unique_per_call() {
        assert_ne!(owner_id_from_host(), owner_id_from_host());
    }

    #[test]
    fn test_new_manager_starts_not_ready() {
        let db: SharedDb = Arc::new(crate::db::sqlite::open_test_store().unwrap());
        let m = Manager::new(db, "owner-1", MigratorConfig::default());
        assert!(!m.ready());
        assert_eq!(m.last_error(), "");
        assert_eq!(m.owner(), "owner-1");
    }

    #[test]
    fn test_zero_config_is_normalized() {
        let db: SharedDb = Arc::new(crate::db::sqlite::open_test_store().unwrap());
        let cfg = MigratorConfig {
            lock_key: String::new(),
            lease_for: Duration::ZERO,
            ..MigratorConfig::default()
        };
        let m = Manager::new(db, "o", cfg);
        assert_eq!(m.config().lock_key, crate::config::DEFAULT_LOCK_KEY);
        assert_eq!(m.config().lease_for, crate::config::DEFAULT_LEASE_FOR);
    }

    #[tokio::test]
    async fn test_bounded_reports_timeout_and_cancel() {
        let ctx = CancellationToken::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, AppError>(())
        };
        let err = bounded(&ctx, Duration::from_millis(20), "slow op", slow).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout(ref label) if label.starts_with("slow op")));

        ctx.cancel();
        let err = bounded(&ctx, Duration::from_secs(5), "any", async { Ok::<_, AppError>(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }
}
