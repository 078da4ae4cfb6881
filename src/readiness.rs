use crate::error::AppError;
use crate::migrator::Manager;

/// Methods with this suffix bypass the gate.
pub const HEALTH_CHECK_SUFFIX: &str = "/HealthCheck";

const DEFAULT_UNAVAILABLE: &str = "database unavailable";

/// A non-blocking readiness signal polled by request interceptors.
pub trait Readiness: Send + Sync {
    fn ready(&self) -> bool;

    /// Why the signal is not ready. Empty when ready or when unknown.
    fn last_error(&self) -> String;
}

impl Readiness for Manager {
    fn ready(&self) -> bool {
        Manager::ready(self)
    }

    fn last_error(&self) -> String {
        Manager::last_error(self)
    }
}

/// Decide whether a request for `method` may proceed.
///
/// Health checks always pass so orchestrators can still probe a service
/// that is stuck not-ready.
pub fn gate_check(readiness: &dyn Readiness, method: &str) -> Result<(), AppError> {
    if method.ends_with(HEALTH_CHECK_SUFFIX) || readiness.ready() {
        return Ok(());
    }

    let reason = readiness.last_error();
    if reason.is_empty() {
        return Err(AppError::Unavailable(DEFAULT_UNAVAILABLE.to_string()));
    }
    Err(AppError::Unavailable(reason))
}
