//! Activity window oracle: cached, read-only admission checks.

use super::error::RepositoryError;
use super::repository::ActivityRepository;
use super::types::{Activity, ActivityId, AdmissionState};
use crate::utils::current_time_millis;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone)]
struct CachedActivity {
    activity: Activity,
    fetched_at_ms: u64,
}

/// Answers "is this activity admitting right now?" from a short-TTL cache
/// in front of the activity repository.
///
/// The cache can serve metadata up to `ttl_ms` old, so an activity closed
/// by a status sweep may still read as open for that long. The stock
/// counter remains the final gate either way. Status transitions that must
/// be seen immediately go through [`invalidate`](Self::invalidate).
///
/// Unknown activities are not cached, so an activity created after a
/// `NotFound` answer is visible on the next call.
#[derive(Debug)]
pub struct ActivityWindowOracle<A> {
    repository: Arc<A>,
    cache: DashMap<ActivityId, CachedActivity>,
    ttl_ms: u64,
}

impl<A: ActivityRepository> ActivityWindowOracle<A> {
    /// Create an oracle over `repository` with the given cache TTL.
    #[must_use]
    pub fn new(repository: Arc<A>, ttl_ms: u64) -> Self {
        Self {
            repository,
            cache: DashMap::new(),
            ttl_ms,
        }
    }

    /// Activity metadata as seen at `now_ms`, from cache when fresh.
    ///
    /// An entry is fresh while `fetched_at <= now_ms < fetched_at + ttl`,
    /// both read on the caller's clock. An entry stamped later than `now_ms`
    /// is refetched.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the repository must be consulted and
    /// fails.
    pub async fn activity_at(
        &self,
        activity_id: ActivityId,
        now_ms: u64,
    ) -> Result<Option<Activity>, RepositoryError> {
        let cached = self
            .cache
            .get(&activity_id)
            .filter(|entry| {
                entry.fetched_at_ms <= now_ms
                    && now_ms < entry.fetched_at_ms.saturating_add(self.ttl_ms)
            })
            .map(|entry| entry.activity.clone());
        if cached.is_some() {
            return Ok(cached);
        }

        trace!(%activity_id, "activity cache miss");
        let fetched = self.repository.get_activity(activity_id).await?;
        match &fetched {
            Some(activity) => {
                self.cache.insert(
                    activity_id,
                    CachedActivity {
                        activity: activity.clone(),
                        fetched_at_ms: now_ms,
                    },
                );
            }
            None => {
                self.cache.remove(&activity_id);
            }
        }
        Ok(fetched)
    }

    /// [`activity_at`](Self::activity_at) the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the repository must be consulted and
    /// fails.
    pub async fn activity(&self, activity_id: ActivityId) -> Result<Option<Activity>, RepositoryError> {
        self.activity_at(activity_id, current_time_millis()).await
    }

    /// Admission state at the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the repository must be consulted and
    /// fails.
    pub async fn admission_state(
        &self,
        activity_id: ActivityId,
    ) -> Result<AdmissionState, RepositoryError> {
        self.admission_state_at(activity_id, current_time_millis())
            .await
    }

    /// Admission state at `now_ms`. Has no side effects beyond the cache.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError`] if the repository must be consulted and
    /// fails.
    pub async fn admission_state_at(
        &self,
        activity_id: ActivityId,
        now_ms: u64,
    ) -> Result<AdmissionState, RepositoryError> {
        Ok(self
            .activity_at(activity_id, now_ms)
            .await?
            .map_or(AdmissionState::NotFound, |a| a.admission_state_at(now_ms)))
    }

    /// Drop the cached entry for an activity.
    pub fn invalidate(&self, activity_id: ActivityId) {
        self.cache.remove(&activity_id);
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}
