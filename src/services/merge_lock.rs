//! Short-lived, non-blocking leases serializing chunk merges per
//! (owner, content hash).
//!
//! A lease is a row in `merge_locks` with a random token and an expiry.
//! Acquisition succeeds when no row exists or the existing one has expired;
//! release only deletes the row if the token still matches, so a holder whose
//! lease expired cannot free someone else's.

use super::{StoreError, StoreResult};
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct MergeLock {
    db: SqlitePool,
    ttl: Duration,
}

/// Proof of a held lease. Pass it back to [`MergeLock::release`].
#[derive(Debug)]
#[must_use = "a merge lease should be released"]
pub struct MergeGuard {
    key: String,
    token: String,
}

impl MergeGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl MergeLock {
    pub fn new(db: SqlitePool, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub fn key_for(owner_id: Uuid, hash: &str) -> String {
        format!("lock:merge:{owner_id}:{hash}")
    }

    /// Try to take the lease once. A live lease held by anyone else is a
    /// `Conflict`.
    pub async fn acquire(&self, key: &str) -> StoreResult<MergeGuard> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.ttl.as_millis() as i64;
        let token = Uuid::new_v4().to_string();

        let result = sqlx::query(
            "INSERT INTO merge_locks (lock_key, token, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(lock_key) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
             WHERE merge_locks.expires_at <= ?",
        )
        .bind(key)
        .bind(&token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict("lock is busy".into()));
        }
        debug!(key, "merge lease acquired");
        Ok(MergeGuard {
            key: key.to_string(),
            token,
        })
    }

    pub async fn release(&self, guard: MergeGuard) {
        let released = sqlx::query("DELETE FROM merge_locks WHERE lock_key = ? AND token = ?")
            .bind(&guard.key)
            .bind(&guard.token)
            .execute(&self.db)
            .await;
        match released {
            Ok(result) if result.rows_affected() == 0 => {
                warn!(key = %guard.key, "merge lease expired before release");
            }
            Ok(_) => debug!(key = %guard.key, "merge lease released"),
            Err(err) => warn!(key = %guard.key, error = %err, "failed to release merge lease"),
        }
    }
}
