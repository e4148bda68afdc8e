// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Access resolution: may this user view this course?
//!
//! Checks run in priority order, first match wins:
//! 1. enrollment at the canonical ID with a granting status
//! 2. any enrollment for the pair filed under another ID
//! 3. the legacy `courseAccess` flag or `enrolledCourses` entry on the user
//! 4. deny
//!
//! A store failure never turns into a silent grant or a plain denial: the
//! caller gets `granted = false` with `retryable = true`.

use crate::db::{with_timeout, CourseStore};
use crate::error::AppError;
use crate::models::EnrollmentKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Why access was granted or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "&'static str")]
pub enum AccessReason {
    Enrolled,
    EnrolledLegacyId,
    LegacyAccessFlag,
    NoCourseAccess,
    Unavailable,
}

impl AccessReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessReason::Enrolled => "Enrolled",
            AccessReason::EnrolledLegacyId => "Enrolled (legacy id)",
            AccessReason::LegacyAccessFlag => "Legacy access flag",
            AccessReason::NoCourseAccess => "No course access",
            AccessReason::Unavailable => "Access check unavailable",
        }
    }
}

impl From<AccessReason> for &'static str {
    fn from(reason: AccessReason) -> Self {
        reason.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub granted: bool,
    pub reason: AccessReason,
    pub granted_at: Option<DateTime<Utc>>,
    /// The check could not be completed; ask again later.
    pub retryable: bool,
}

impl AccessDecision {
    fn granted(reason: AccessReason, granted_at: Option<DateTime<Utc>>) -> Self {
        Self {
            granted: true,
            reason,
            granted_at,
            retryable: false,
        }
    }

    fn denied() -> Self {
        Self {
            granted: false,
            reason: AccessReason::NoCourseAccess,
            granted_at: None,
            retryable: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            granted: false,
            reason: AccessReason::Unavailable,
            granted_at: None,
            retryable: true,
        }
    }
}

struct CachedDecision {
    decision: AccessDecision,
    inserted_at: Instant,
}

/// Bounded TTL cache of access decisions keyed by (user, course).
pub struct AccessCache {
    entries: DashMap<(String, String), CachedDecision>,
    ttl: Duration,
    capacity: usize,
}

impl AccessCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, user_id: &str, course_id: &str) -> Option<AccessDecision> {
        let key = (user_id.to_string(), course_id.to_string());
        let now = Instant::now();
        if let Some(entry) = self.entries.get(&key) {
            if now.duration_since(entry.inserted_at) < self.ttl {
                return Some(entry.decision.clone());
            }
        }
        // Either missing or stale; drop it only if still stale.
        self.entries
            .remove_if(&key, |_, e| now.duration_since(e.inserted_at) >= self.ttl);
        None
    }

    /// Cache a decision. Retryable decisions are never stored.
    pub fn insert(&self, user_id: &str, course_id: &str, decision: AccessDecision) {
        if decision.retryable {
            return;
        }
        let key = (user_id.to_string(), course_id.to_string());
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.insert(
            key,
            CachedDecision {
                decision,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Make room for one entry: drop everything expired, then the oldest
    /// entry if still full.
    fn evict(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
        if self.entries.len() < self.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().inserted_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn invalidate(&self, user_id: &str, course_id: &str) {
        self.entries
            .remove(&(user_id.to_string(), course_id.to_string()));
    }

    pub fn invalidate_user(&self, user_id: &str) {
        self.entries.retain(|(u, _), _| u != user_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read-only access checks with an injected cache.
pub struct AccessResolver {
    store: Arc<dyn CourseStore>,
    cache: Arc<AccessCache>,
    store_timeout: Duration,
}

impl AccessResolver {
    pub fn new(store: Arc<dyn CourseStore>, cache: Arc<AccessCache>, store_timeout: Duration) -> Self {
        Self {
            store,
            cache,
            store_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<AccessCache> {
        &self.cache
    }

    /// Decide whether `user_id` may view `course_id`.
    ///
    /// Only malformed identifiers produce an `Err`; store trouble is folded
    /// into a retryable denial.
    pub async fn has_access(&self, user_id: &str, course_id: &str) -> Result<AccessDecision, AppError> {
        let key = EnrollmentKey::new(user_id, course_id)?;

        if let Some(decision) = self.cache.get(key.user_id(), key.course_id()) {
            return Ok(decision);
        }

        match self.resolve(&key).await {
            Ok(decision) => {
                self.cache
                    .insert(key.user_id(), key.course_id(), decision.clone());
                Ok(decision)
            }
            Err(e) => {
                tracing::warn!(
                    user_id = key.user_id(),
                    course_id = key.course_id(),
                    error = %e,
                    "Access check failed, denying with retry"
                );
                Ok(AccessDecision::unavailable())
            }
        }
    }

    async fn resolve(&self, key: &EnrollmentKey) -> Result<AccessDecision, AppError> {
        let canonical = with_timeout(
            self.store_timeout,
            self.store.get_enrollment(&key.document_id()),
        )
        .await?;
        if let Some(enrollment) = canonical.filter(|e| e.status.grants_access()) {
            return Ok(AccessDecision::granted(
                AccessReason::Enrolled,
                Some(enrollment.enrolled_at),
            ));
        }

        let canonical_id = key.document_id();
        let legacy = with_timeout(
            self.store_timeout,
            self.store.find_enrollments(key.user_id(), key.course_id()),
        )
        .await?;
        if let Some(enrollment) = legacy
            .into_iter()
            .filter(|e| e.id != canonical_id && e.status.grants_access())
            .min_by_key(|e| e.enrolled_at)
        {
            tracing::debug!(
                user_id = key.user_id(),
                course_id = key.course_id(),
                enrollment_id = %enrollment.id,
                "Access granted via non-canonical enrollment"
            );
            return Ok(AccessDecision::granted(
                AccessReason::EnrolledLegacyId,
                Some(enrollment.enrolled_at),
            ));
        }

        let user = with_timeout(self.store_timeout, self.store.get_user(key.user_id())).await?;
        if let Some(user) = user {
            if user.course_access || user.lists_course(key.course_id()) {
                return Ok(AccessDecision::granted(AccessReason::LegacyAccessFlag, None));
            }
        }

        Ok(AccessDecision::denied())
    }
}
