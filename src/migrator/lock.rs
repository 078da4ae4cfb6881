//! Lease lock over a single document.
//!
//! All lock state lives in one document keyed by the lock key, so every
//! transition is one conditional single-document write. A holder is valid only
//! while `leaseUntil > now`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{Document, Filter, ReturnDocument, SharedDb, Update, ID_FIELD};
use crate::error::AppError;
use crate::migrator::helpers::is_duplicate_key_error;

/// Collection holding lock documents.
pub const LOCKS_COLLECTION: &str = "__locks";

/// Persisted lock document. Timestamps are epoch milliseconds so the store
/// can compare them numerically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub lease_until: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl LockDoc {
    fn from_document(doc: Document) -> Result<Self, AppError> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }

    fn into_document(self) -> Result<Document, AppError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(AppError::Internal("lock document did not serialize to an object".into())),
        }
    }
}

/// Outcome of [`Locker::try_acquire_with_info`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquireInfo {
    pub acquired: bool,
    /// This call inserted the lock document.
    pub created: bool,
    /// The lock was taken from a different owner whose lease had lapsed.
    pub takeover: bool,
    pub prev_owner: Option<String>,
    pub prev_lease_until: Option<DateTime<Utc>>,
    pub new_owner: Option<String>,
    pub new_lease_until: Option<DateTime<Utc>>,
}

pub struct Locker {
    db: SharedDb,
    lock_key: String,
    owner: String,
    lease_for: ChronoDuration,
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

impl Locker {
    pub fn new(db: SharedDb, lock_key: &str, owner: &str, lease_for: std::time::Duration) -> Self {
        Self {
            db,
            lock_key: lock_key.to_string(),
            owner: owner.to_string(),
            lease_for: ChronoDuration::from_std(lease_for).unwrap_or_else(|_| ChronoDuration::days(365)),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Matches our lock when it is free, expired, or already ours.
    fn acquirable_filter(&self, now: DateTime<Utc>) -> Filter {
        Filter::And(vec![
            Filter::eq(ID_FIELD, self.lock_key.as_str()),
            Filter::Or(vec![
                Filter::lte("leaseUntil", millis(now)),
                Filter::exists("leaseUntil", false),
                Filter::eq("owner", self.owner.as_str()),
            ]),
        ])
    }

    fn owned_filter(&self) -> Filter {
        Filter::And(vec![
            Filter::eq(ID_FIELD, self.lock_key.as_str()),
            Filter::eq("owner", self.owner.as_str()),
        ])
    }

    fn claim(&self, now: DateTime<Utc>) -> (Update, DateTime<Utc>) {
        let lease_until = now + self.lease_for;
        let update = Update::new()
            .set("owner", self.owner.as_str())
            .set("leaseUntil", millis(lease_until))
            .set("updatedAt", millis(now));
        (update, lease_until)
    }

    /// Insert the lock document with ourselves as owner. `Ok(false)` when a
    /// concurrent insert won the race.
    async fn insert_fresh(&self, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Result<bool, AppError> {
        let doc = LockDoc {
            id: self.lock_key.clone(),
            owner: self.owner.clone(),
            lease_until: Some(lease_until),
            updated_at: now,
        }
        .into_document()?;

        match self.db.insert_one(LOCKS_COLLECTION, doc).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key_error(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Try to become (or stay) the lease holder.
    pub async fn try_acquire(&self) -> Result<bool, AppError> {
        let now = Utc::now();
        let (update, lease_until) = self.claim(now);

        let after = self
            .db
            .find_one_and_update(
                LOCKS_COLLECTION,
                &self.acquirable_filter(now),
                &update,
                ReturnDocument::After,
            )
            .await?;

        if let Some(doc) = after {
            return Ok(LockDoc::from_document(doc)?.owner == self.owner);
        }

        // Either the document is missing or someone else holds a live lease;
        // the insert tells the two apart.
        self.insert_fresh(now, lease_until).await
    }

    /// Like [`Locker::try_acquire`], also reporting whether the lock was
    /// created or taken over from another owner.
    pub async fn try_acquire_with_info(&self) -> Result<AcquireInfo, AppError> {
        let now = Utc::now();
        let (update, lease_until) = self.claim(now);

        let before = self
            .db
            .find_one_and_update(
                LOCKS_COLLECTION,
                &self.acquirable_filter(now),
                &update,
                ReturnDocument::Before,
            )
            .await?;

        if let Some(doc) = before {
            let prev = LockDoc::from_document(doc)?;
            let takeover = !prev.owner.is_empty() && prev.owner != self.owner;
            return Ok(AcquireInfo {
                acquired: true,
                created: false,
                takeover,
                prev_owner: (!prev.owner.is_empty()).then_some(prev.owner),
                prev_lease_until: prev.lease_until,
                new_owner: Some(self.owner.clone()),
                new_lease_until: Some(lease_until),
            });
        }

        if !self.insert_fresh(now, lease_until).await? {
            return Ok(AcquireInfo::default());
        }

        Ok(AcquireInfo {
            acquired: true,
            created: true,
            new_owner: Some(self.owner.clone()),
            new_lease_until: Some(lease_until),
            ..AcquireInfo::default()
        })
    }

    /// Extend our lease. Fails with `LeaseLost` if the lock is no longer ours.
    pub async fn renew(&self) -> Result<(), AppError> {
        let now = Utc::now();
        let update = Update::new()
            .set("leaseUntil", millis(now + self.lease_for))
            .set("updatedAt", millis(now));

        let matched = self
            .db
            .update_one(LOCKS_COLLECTION, &self.owned_filter(), &update)
            .await?;

        if matched == 0 {
            return Err(AppError::LeaseLost(format!(
                "lock {:?} is no longer held by {:?}",
                self.lock_key, self.owner
            )));
        }
        Ok(())
    }

    /// Give the lock up: expire the lease and clear the owner. A no-op if we
    /// are not the owner.
    pub async fn release(&self) -> Result<(), AppError> {
        let now = Utc::now();
        let update = Update::new()
            .set("leaseUntil", millis(now - ChronoDuration::seconds(1)))
            .set("updatedAt", millis(now))
            .unset("owner");

        self.db
            .update_one(LOCKS_COLLECTION, &self.owned_filter(), &update)
            .await?;
        Ok(())
    }

    /// Current lock document, if any.
    pub async fn current(&self) -> Result<Option<LockDoc>, AppError> {
        let doc = self
            .db
            .find_one(
                LOCKS_COLLECTION,
                &Filter::eq(ID_FIELD, self.lock_key.as_str()),
                &Default::default(),
            )
            .await?;
        doc.map(LockDoc::from_document).transpose()
    }
}
