// libs/scheduling-cell/src/services/slot_lock.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_database::{DbError, PostgrestClient};

use crate::models::{SchedulingError, SlotLock};

/// Persisted advisory lock on a (provider, slot start) pair.
///
/// Uniqueness is enforced by the storage constraint on
/// `(provider_id, slot_start)`: under a race exactly one insert wins and the
/// loser sees a row conflict, never a low-level failure. Expiry is passive:
/// every reader treats an expired row as absent whether or not a cleanup
/// pass removed it yet.
pub struct SlotLockService {
    store: Arc<PostgrestClient>,
    ttl_minutes: i64,
}

impl SlotLockService {
    pub fn new(store: Arc<PostgrestClient>, ttl_minutes: i64) -> Self {
        Self { store, ttl_minutes }
    }

    pub async fn acquire(
        &self,
        provider_id: Uuid,
        slot_start: DateTime<Utc>,
        duration_minutes: i32,
        holder_id: Uuid,
    ) -> Result<SlotLock, SchedulingError> {
        let now = Utc::now();
        let window_end = slot_start + Duration::minutes(duration_minutes as i64);

        // An unexpired lock of another holder anywhere in the window blocks
        // acquisition, not just an exact start-time match. Expiry is checked
        // here as well: a row the cleanup pass has not swept yet is absent.
        let active_locks = self.get_unexpired_locks(provider_id, now).await?;
        let blocked = active_locks.iter().any(|lock| {
            !lock.is_expired(now)
                && lock.holder_id != holder_id
                && lock.slot_start < window_end
                && slot_start < lock.window_end()
        });
        if blocked {
            debug!(
                "Lock window {} - {} for provider {} already held",
                slot_start, window_end, provider_id
            );
            return Err(SchedulingError::Conflict);
        }

        match self
            .try_insert(provider_id, slot_start, duration_minutes, holder_id)
            .await
        {
            Ok(lock) => {
                debug!("Slot lock acquired: provider {} at {}", provider_id, slot_start);
                Ok(lock)
            }
            Err(SchedulingError::Conflict) => {
                self.resolve_insert_conflict(provider_id, slot_start, duration_minutes, holder_id, now)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Releasing an unknown or already-expired token is a no-op.
    pub async fn release(&self, token: Uuid) -> Result<(), SchedulingError> {
        let path = format!("/rest/v1/slot_locks?token=eq.{}", token);
        let _: Vec<Value> = self
            .store
            .request(Method::DELETE, &path, None, None)
            .await
            .map_err(|e| SchedulingError::DatabaseError(format!("Lock release failed: {}", e)))?;

        debug!("Slot lock released: {}", token);
        Ok(())
    }

    /// Bounds lock-table growth; never required for correctness.
    pub async fn cleanup_expired(&self) -> Result<u32, SchedulingError> {
        let now = Utc::now();

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Prefer",
            reqwest::header::HeaderValue::from_static("return=representation"),
        );

        let removed: Vec<Value> = self
            .store
            .request_with_headers(
                Method::DELETE,
                &format!(
                    "/rest/v1/slot_locks?expires_at=lt.{}",
                    urlencoding::encode(&now.to_rfc3339())
                ),
                None,
                None,
                Some(headers),
            )
            .await
            .map_err(|e| SchedulingError::DatabaseError(format!("Lock cleanup failed: {}", e)))?;

        let cleaned = removed.len() as u32;
        if cleaned > 0 {
            info!("Cleaned up {} expired slot locks", cleaned);
        }

        Ok(cleaned)
    }

    // ==========================================================================
    // PRIVATE HELPERS
    // ==========================================================================

    async fn try_insert(
        &self,
        provider_id: Uuid,
        slot_start: DateTime<Utc>,
        duration_minutes: i32,
        holder_id: Uuid,
    ) -> Result<SlotLock, SchedulingError> {
        let now = Utc::now();
        let lock_data = json!({
            "provider_id": provider_id,
            "slot_start": slot_start.to_rfc3339(),
            "duration_minutes": duration_minutes,
            "holder_id": holder_id,
            "token": Uuid::new_v4(),
            "expires_at": (now + Duration::minutes(self.ttl_minutes)).to_rfc3339(),
            "created_at": now.to_rfc3339()
        });

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Prefer",
            reqwest::header::HeaderValue::from_static("return=representation"),
        );

        let result: Result<Vec<Value>, DbError> = self
            .store
            .request_with_headers(
                Method::POST,
                "/rest/v1/slot_locks",
                None,
                Some(lock_data),
                Some(headers),
            )
            .await;

        match result {
            Ok(rows) => rows
                .first()
                .cloned()
                .ok_or_else(|| {
                    SchedulingError::DatabaseError("Lock insert returned no row".to_string())
                })
                .and_then(|row| {
                    serde_json::from_value(row).map_err(|e| {
                        SchedulingError::DatabaseError(format!("Failed to parse lock: {}", e))
                    })
                }),
            Err(DbError::Conflict(_)) => Err(SchedulingError::Conflict),
            Err(e) => Err(SchedulingError::DatabaseError(format!(
                "Lock insert failed: {}",
                e
            ))),
        }
    }

    /// The unique constraint fired: decide between a stale row we may sweep,
    /// our own lock to refresh, and a genuinely held slot.
    async fn resolve_insert_conflict(
        &self,
        provider_id: Uuid,
        slot_start: DateTime<Utc>,
        duration_minutes: i32,
        holder_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SlotLock, SchedulingError> {
        let existing = self.get_lock_at(provider_id, slot_start).await?;

        let Some(existing) = existing else {
            // Deleted between our insert and this read; the competing caller
            // owns the race outcome.
            return Err(SchedulingError::Conflict);
        };

        if existing.is_expired(now) {
            debug!("Sweeping expired lock {} before retry", existing.token);
            self.release(existing.token).await?;
            // Exactly one retry; a second conflict means another caller won.
            return self
                .try_insert(provider_id, slot_start, duration_minutes, holder_id)
                .await;
        }

        if existing.holder_id == holder_id {
            return self.refresh(existing).await;
        }

        warn!(
            "Slot lock contention: provider {} at {} held by another requester",
            provider_id, slot_start
        );
        Err(SchedulingError::Conflict)
    }

    async fn refresh(&self, lock: SlotLock) -> Result<SlotLock, SchedulingError> {
        let expires_at = Utc::now() + Duration::minutes(self.ttl_minutes);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Prefer",
            reqwest::header::HeaderValue::from_static("return=representation"),
        );

        let result: Vec<Value> = self
            .store
            .request_with_headers(
                Method::PATCH,
                &format!("/rest/v1/slot_locks?id=eq.{}", lock.id),
                None,
                Some(json!({ "expires_at": expires_at.to_rfc3339() })),
                Some(headers),
            )
            .await
            .map_err(|e| SchedulingError::DatabaseError(format!("Lock refresh failed: {}", e)))?;

        if result.is_empty() {
            return Err(SchedulingError::Conflict);
        }

        serde_json::from_value(result[0].clone())
            .map_err(|e| SchedulingError::DatabaseError(format!("Failed to parse lock: {}", e)))
    }

    async fn get_unexpired_locks(
        &self,
        provider_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<SlotLock>, SchedulingError> {
        let path = format!(
            "/rest/v1/slot_locks?provider_id=eq.{}&expires_at=gt.{}",
            provider_id,
            urlencoding::encode(&now.to_rfc3339())
        );
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| SchedulingError::DatabaseError(format!("Lock scan failed: {}", e)))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<SlotLock>, _>>()
            .map_err(|e| SchedulingError::DatabaseError(format!("Failed to parse locks: {}", e)))
    }

    async fn get_lock_at(
        &self,
        provider_id: Uuid,
        slot_start: DateTime<Utc>,
    ) -> Result<Option<SlotLock>, SchedulingError> {
        let path = format!(
            "/rest/v1/slot_locks?provider_id=eq.{}&slot_start=eq.{}",
            provider_id,
            urlencoding::encode(&slot_start.to_rfc3339())
        );
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| SchedulingError::DatabaseError(format!("Lock lookup failed: {}", e)))?;

        result
            .into_iter()
            .next()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| {
                    SchedulingError::DatabaseError(format!("Failed to parse lock: {}", e))
                })
            })
            .transpose()
    }
}
