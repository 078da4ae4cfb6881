//! Database reachability monitor with a manual gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::SharedDb;
use crate::error::AppError;
use crate::readiness::Readiness;

const NOT_CHECKED_YET: &str = "database not checked yet";
const GATE_CLOSED: &str = "database gate closed";
const UNAVAILABLE: &str = "database unavailable";

/// Tracks whether the database answers pings. Operators can additionally
/// close a gate to force not-ready regardless of the ping result.
pub struct DbReadiness {
    db: SharedDb,
    timeout: Duration,
    up: AtomicBool,
    ping_error: RwLock<String>,
    gate_open: AtomicBool,
    gate_reason: RwLock<String>,
}

fn store(slot: &RwLock<String>, value: &str) {
    let mut guard = slot.write().unwrap_or_else(|e| e.into_inner());
    guard.clear();
    guard.push_str(value);
}

fn load(slot: &RwLock<String>) -> String {
    slot.read().unwrap_or_else(|e| e.into_inner()).clone()
}

impl DbReadiness {
    pub fn new(db: SharedDb, timeout: Duration) -> Self {
        Self {
            db,
            timeout,
            up: AtomicBool::new(false),
            ping_error: RwLock::new(NOT_CHECKED_YET.to_string()),
            gate_open: AtomicBool::new(true),
            gate_reason: RwLock::new(String::new()),
        }
    }

    pub fn close_gate(&self, reason: &str) {
        let reason = if reason.is_empty() { GATE_CLOSED } else { reason };
        store(&self.gate_reason, reason);
        self.gate_open.store(false, Ordering::Release);
    }

    pub fn open_gate(&self) {
        store(&self.gate_reason, "");
        self.gate_open.store(true, Ordering::Release);
    }

    /// Ping once and record the outcome. Up/down transitions are logged once.
    pub async fn check_now(&self) -> Result<(), AppError> {
        let outcome = match tokio::time::timeout(self.timeout, self.db.ping()).await {
            Ok(res) => res,
            Err(_) => Err(AppError::Timeout(format!("database ping after {:?}", self.timeout))),
        };

        match outcome {
            Ok(()) => {
                store(&self.ping_error, "");
                if !self.up.swap(true, Ordering::AcqRel) {
                    tracing::info!(scope = "health", "Database is up");
                }
                Ok(())
            }
            Err(e) => {
                store(&self.ping_error, &e.to_string());
                if self.up.swap(false, Ordering::AcqRel) {
                    tracing::warn!(scope = "health", error = %e, "Database is down");
                }
                Err(e)
            }
        }
    }

    /// Check immediately, then every `interval` until `ctx` is cancelled.
    pub async fn run(&self, ctx: CancellationToken, interval: Duration) {
        let _ = self.check_now().await;

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    let _ = self.check_now().await;
                }
            }
        }
    }
}

impl Readiness for DbReadiness {
    fn ready(&self) -> bool {
        self.gate_open.load(Ordering::Acquire) && self.up.load(Ordering::Acquire)
    }

    fn last_error(&self) -> String {
        if !self.gate_open.load(Ordering::Acquire) {
            let reason = load(&self.gate_reason);
            return if reason.is_empty() { GATE_CLOSED.to_string() } else { reason };
        }
        if !self.up.load(Ordering::Acquire) {
            let err = load(&self.ping_error);
            return if err.is_empty() { UNAVAILABLE.to_string() } else { err };
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_test_store;
    use std::sync::Arc;

    fn monitor() -> DbReadiness {
        DbReadiness::new(Arc::new(open_test_store().unwrap()), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_not_ready_until_first_check() {
        let r = monitor();
        assert!(!r.ready());
        assert_eq!(r.last_error(), NOT_CHECKED_YET);

        r.check_now().await.unwrap();
        assert!(r.ready());
        assert_eq!(r.last_error(), "");
    }

    #[tokio::test]
    async fn test_gate_overrides_ping() {
        let r = monitor();
        r.check_now().await.unwrap();

        r.close_gate("maintenance");
        assert!(!r.ready());
        assert_eq!(r.last_error(), "maintenance");

        r.close_gate("");
        assert_eq!(r.last_error(), GATE_CLOSED);

        r.open_gate();
        assert!(r.ready());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let r = Arc::new(monitor());
        let ctx = CancellationToken::new();
        let task = tokio::spawn({
            let r = r.clone();
            let ctx = ctx.clone();
            async move { r.run(ctx, Duration::from_millis(10)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(r.ready());
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
