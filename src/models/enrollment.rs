// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Enrollment model: the authoritative record that a user owns a course.
//!
//! Stored documents come in several historical shapes. Reading always goes
//! through [`StoredEnrollment`] and a single migration into the canonical
//! [`Enrollment`]; writing always produces the canonical shape.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Current canonical document layout.
pub const ENROLLMENT_SCHEMA_VERSION: u32 = 2;

const MAX_ID_LEN: usize = 256;

/// Enrollment lifecycle. Written upper-case, read case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Pending,
    /// Anything else found in storage (cancelled, refunded, typos).
    Inactive,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "ACTIVE",
            EnrollmentStatus::Completed => "COMPLETED",
            EnrollmentStatus::Pending => "PENDING",
            EnrollmentStatus::Inactive => "INACTIVE",
        }
    }

    /// ACTIVE and COMPLETED both mean the learner owns the course.
    pub fn grants_access(self) -> bool {
        matches!(self, EnrollmentStatus::Active | EnrollmentStatus::Completed)
    }

    /// Precedence used when merging duplicate records.
    pub fn rank(self) -> u8 {
        match self {
            EnrollmentStatus::Completed => 3,
            EnrollmentStatus::Active => 2,
            EnrollmentStatus::Pending => 1,
            EnrollmentStatus::Inactive => 0,
        }
    }
}

impl From<String> for EnrollmentStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => EnrollmentStatus::Active,
            "COMPLETED" => EnrollmentStatus::Completed,
            "PENDING" => EnrollmentStatus::Pending,
            _ => EnrollmentStatus::Inactive,
        }
    }
}

impl From<EnrollmentStatus> for &'static str {
    fn from(status: EnrollmentStatus) -> Self {
        status.as_str()
    }
}

/// Validated (user, course) pair and its canonical document ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnrollmentKey {
    user_id: String,
    course_id: String,
}

impl EnrollmentKey {
    pub fn new(user_id: &str, course_id: &str) -> Result<Self, AppError> {
        Ok(Self {
            user_id: validate_id("userId", user_id)?.to_string(),
            course_id: validate_id("courseId", course_id)?.to_string(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    /// `{userId}_{courseId}`
    pub fn document_id(&self) -> String {
        canonical_enrollment_id(&self.user_id, &self.course_id)
    }
}

pub fn canonical_enrollment_id(user_id: &str, course_id: &str) -> String {
    format!("{}_{}", user_id, course_id)
}

/// Validate an opaque document identifier.
pub fn validate_id<'a>(field: &str, value: &'a str) -> Result<&'a str, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidArgument(format!("{field} is required")));
    }
    if trimmed.len() > MAX_ID_LEN {
        return Err(AppError::InvalidArgument(format!("{field} is too long")));
    }
    if trimmed.contains('/') {
        return Err(AppError::InvalidArgument(format!(
            "{field} must not contain '/'"
        )));
    }
    Ok(trimmed)
}

/// Canonical enrollment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredEnrollment")]
pub struct Enrollment {
    /// Document ID. Canonical records use `{userId}_{courseId}`; older write
    /// paths produced random IDs.
    pub id: String,
    pub schema_version: u32,
    pub user_id: String,
    pub course_id: String,
    pub status: EnrollmentStatus,
    /// Completed fraction in `0.0..=1.0`
    pub progress: f64,
    pub completed_lessons: BTreeSet<String>,
    pub current_lesson: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub payment_session_id: Option<String>,
    /// Set when the stored document used an older layout and should be
    /// rewritten.
    #[serde(skip)]
    pub legacy_shape: bool,
}

impl Enrollment {
    /// Fresh ACTIVE enrollment at the canonical ID.
    pub fn new_active(
        key: &EnrollmentKey,
        payment_session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: key.document_id(),
            schema_version: ENROLLMENT_SCHEMA_VERSION,
            user_id: key.user_id().to_string(),
            course_id: key.course_id().to_string(),
            status: EnrollmentStatus::Active,
            progress: 0.0,
            completed_lessons: BTreeSet::new(),
            current_lesson: None,
            enrolled_at: now,
            last_accessed_at: now,
            completed_at: None,
            payment_session_id: payment_session_id.map(str::to_string),
            legacy_shape: false,
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.id == canonical_enrollment_id(&self.user_id, &self.course_id)
            && !self.legacy_shape
    }

    /// Recompute `progress` against the course's lesson total. The total
    /// never drops below the number of completed lessons, so progress stays
    /// within `0.0..=1.0`.
    pub fn recompute_progress(&mut self, total_lessons: u32) -> f64 {
        let completed = self.completed_lessons.len() as u32;
        let total = total_lessons.max(completed);
        self.progress = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };
        self.progress
    }

    /// Progress as a whole percentage for dashboards.
    pub fn percentage(&self) -> u32 {
        (self.progress * 100.0).round().clamp(0.0, 100.0) as u32
    }
}

/// Merge several records for the same (user, course) into one canonical
/// record. Returns `None` for an empty input.
pub fn merge_enrollments(key: &EnrollmentKey, records: &[Enrollment]) -> Option<Enrollment> {
    let first = records.first()?;
    let canonical_id = key.document_id();

    // Prefer the canonical record as the base so its payment session wins.
    let base = records
        .iter()
        .find(|e| e.id == canonical_id)
        .unwrap_or(first);

    let mut merged = base.clone();
    merged.id = canonical_id;
    merged.schema_version = ENROLLMENT_SCHEMA_VERSION;
    merged.user_id = key.user_id().to_string();
    merged.course_id = key.course_id().to_string();
    merged.legacy_shape = false;

    let mut latest_access = base.last_accessed_at;
    for record in records {
        if record.status.rank() > merged.status.rank() {
            merged.status = record.status;
        }
        merged
            .completed_lessons
            .extend(record.completed_lessons.iter().cloned());
        merged.progress = merged.progress.max(record.progress);
        merged.enrolled_at = merged.enrolled_at.min(record.enrolled_at);
        if record.last_accessed_at > latest_access {
            latest_access = record.last_accessed_at;
            if record.current_lesson.is_some() {
                merged.current_lesson = record.current_lesson.clone();
            }
        }
        if merged.payment_session_id.is_none() {
            merged.payment_session_id = record.payment_session_id.clone();
        }
        if merged.completed_at.is_none() {
            merged.completed_at = record.completed_at;
        }
    }
    merged.last_accessed_at = latest_access;
    if merged.status != EnrollmentStatus::Completed {
        merged.completed_at = None;
    }

    Some(merged)
}

// ─── Stored (on-disk) shapes ─────────────────────────────────────

/// Enrollment document as it may appear in Firestore, across all layouts.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEnrollment {
    #[serde(rename = "_firestore_id", default)]
    firestore_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    schema_version: u32,
    user_id: String,
    course_id: String,
    #[serde(default)]
    status: Option<EnrollmentStatus>,
    #[serde(default)]
    progress: Option<StoredProgress>,
    #[serde(default)]
    completed_lessons: Option<Vec<String>>,
    #[serde(default)]
    current_lesson: Option<String>,
    #[serde(default)]
    enrolled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    payment_session_id: Option<String>,
}

/// `progress` was written either as a bare number or as a nested object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredProgress {
    Flat(f64),
    Nested(NestedProgress),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedProgress {
    #[serde(default)]
    completed_lessons: Vec<String>,
    #[serde(default)]
    current_lesson: Option<String>,
    #[serde(default)]
    total_progress: f64,
}

/// Progress as a fraction in `0..=1`. Documents from before schema
/// version 2 stored whole percentages, so a legacy `1` is 1%.
fn normalize_progress(value: f64, percentage: bool) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    let fraction = if percentage { value / 100.0 } else { value };
    fraction.min(1.0)
}

impl From<StoredEnrollment> for Enrollment {
    fn from(stored: StoredEnrollment) -> Self {
        let mut legacy_shape = stored.schema_version < ENROLLMENT_SCHEMA_VERSION;

        let mut completed_lessons: BTreeSet<String> = stored
            .completed_lessons
            .unwrap_or_default()
            .into_iter()
            .collect();
        let mut current_lesson = stored.current_lesson;

        let progress = match stored.progress {
            Some(StoredProgress::Flat(value)) => normalize_progress(value, legacy_shape),
            Some(StoredProgress::Nested(nested)) => {
                legacy_shape = true;
                completed_lessons.extend(nested.completed_lessons);
                if current_lesson.is_none() {
                    current_lesson = nested.current_lesson;
                }
                normalize_progress(nested.total_progress, true)
            }
            None => 0.0,
        };

        let status = match stored.status {
            Some(status) => status,
            None => {
                // Very old records carried no status at all; existence meant
                // the purchase went through.
                legacy_shape = true;
                EnrollmentStatus::Active
            }
        };

        let enrolled_at = stored
            .enrolled_at
            .or(stored.last_accessed_at)
            .unwrap_or_default();
        let last_accessed_at = stored.last_accessed_at.unwrap_or(enrolled_at);

        let id = stored
            .firestore_id
            .or(stored.id)
            .unwrap_or_else(|| canonical_enrollment_id(&stored.user_id, &stored.course_id));

        Self {
            id,
            schema_version: ENROLLMENT_SCHEMA_VERSION,
            user_id: stored.user_id,
            course_id: stored.course_id,
            status,
            progress,
            completed_lessons,
            current_lesson,
            enrolled_at,
            last_accessed_at,
            completed_at: stored.completed_at,
            payment_session_id: stored.payment_session_id,
            legacy_shape,
        }
    }
}
