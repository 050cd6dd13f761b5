//! Advisory resource locks.
//!
//! Prevents two agents from hammering the same external resource at once
//! (e.g. both running nmap against one host).  A lock is a row in the
//! `locks` table; acquisition is an exclusive insert, so the table's primary
//! key is what makes the protocol race-free.  Locks are advisory — agents
//! must cooperate by acquiring before acting and releasing afterwards.
//!
//! A holder that dies without releasing leaves its row behind; any caller
//! may reclaim a lock older than the stale threshold.  Reclamation deletes
//! the observed row (guarded by its `acquired_at` value) and re-inserts in
//! the same transaction, so two reclaimers cannot both win.

use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::params;
use tracing::{debug, instrument, warn};

use crate::db::Database;
use crate::error::StoreResult;

/// Default age after which a lock may be reclaimed by anyone.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(600);

/// Poll interval while waiting on a held lock.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// SQLite-backed advisory lock manager.
#[derive(Clone)]
pub struct LockManager {
    db: Database,
    stale_threshold: Duration,
}

impl LockManager {
    pub fn new(db: Database) -> Self {
        Self::with_stale_threshold(db, DEFAULT_STALE_THRESHOLD)
    }

    /// Override the stale threshold (tests use short thresholds).
    pub fn with_stale_threshold(db: Database, stale_threshold: Duration) -> Self {
        Self {
            db,
            stale_threshold,
        }
    }

    /// Try to acquire a lock on `resource_id` for `agent_id`.
    ///
    /// With a zero `timeout` this is a single non-blocking attempt;
    /// otherwise the call polls until the deadline.  Returns whether the
    /// lock was acquired.
    #[instrument(skip(self, timeout))]
    pub async fn acquire(
        &self,
        resource_id: &str,
        agent_id: &str,
        timeout: Duration,
    ) -> StoreResult<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.try_acquire(resource_id, agent_id).await? {
                debug!("lock acquired");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(timeout)).await;
        }
    }

    /// One atomic acquisition attempt, including stale reclamation.
    async fn try_acquire(&self, resource_id: &str, agent_id: &str) -> StoreResult<bool> {
        let resource_id = resource_id.to_string();
        let agent_id = agent_id.to_string();
        let stale_millis = self.stale_threshold.as_millis() as i64;

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now().timestamp_millis();

                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO locks (resource_id, owner, acquired_at)
                     VALUES (?1, ?2, ?3)",
                    params![resource_id, agent_id, now],
                )?;
                if inserted == 1 {
                    tx.commit()?;
                    return Ok(true);
                }

                // Held by someone — reclaim only if stale, and only the
                // exact row we observed (acquired_at guard).
                let existing: Option<(String, i64)> = tx
                    .query_row(
                        "SELECT owner, acquired_at FROM locks WHERE resource_id = ?1",
                        params![resource_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .ok();

                let Some((holder, acquired_at)) = existing else {
                    // Row vanished between insert and read; retry next poll.
                    return Ok(false);
                };

                if now - acquired_at <= stale_millis {
                    return Ok(false);
                }

                warn!(resource = %resource_id, stale_owner = %holder, "reclaiming stale lock");
                tx.execute(
                    "DELETE FROM locks WHERE resource_id = ?1 AND acquired_at = ?2",
                    params![resource_id, acquired_at],
                )?;
                let reclaimed = tx.execute(
                    "INSERT OR IGNORE INTO locks (resource_id, owner, acquired_at)
                     VALUES (?1, ?2, ?3)",
                    params![resource_id, agent_id, now],
                )?;
                tx.commit()?;
                Ok(reclaimed == 1)
            })
            .await
    }

    /// Release a lock; succeeds only for the recorded owner.
    #[instrument(skip(self))]
    pub async fn release(&self, resource_id: &str, agent_id: &str) -> StoreResult<bool> {
        let resource_id = resource_id.to_string();
        let agent_id = agent_id.to_string();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM locks WHERE resource_id = ?1 AND owner = ?2",
                    params![resource_id, agent_id],
                )?;
                Ok(deleted == 1)
            })
            .await
    }

    /// Whether any lock record exists for `resource_id`.
    pub async fn is_locked(&self, resource_id: &str) -> StoreResult<bool> {
        Ok(self.owner(resource_id).await?.is_some())
    }

    /// The recorded owner of `resource_id`, if locked.
    pub async fn owner(&self, resource_id: &str) -> StoreResult<Option<String>> {
        let resource_id = resource_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT owner FROM locks WHERE resource_id = ?1",
                    params![resource_id],
                    |row| row.get(0),
                );
                match result {
                    Ok(owner) => Ok(Some(owner)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Remove every lock record (engagement cleanup).
    pub async fn cleanup(&self) -> StoreResult<usize> {
        self.db
            .execute(|conn| {
                let deleted = conn.execute("DELETE FROM locks", [])?;
                Ok(deleted)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
