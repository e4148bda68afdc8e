// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Catalog models (read-mostly from the enrollment core's point of view).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Course document at `courses/{courseId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    /// Document ID, filled in by the store on read.
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub instructor_id: Option<String>,
    /// Cached module count. Can drift from the catalog.
    #[serde(default, alias = "moduleCount")]
    pub total_modules: u32,
    /// Cached lesson count. Can drift from the catalog.
    #[serde(default, alias = "lessonCount")]
    pub total_lessons: u32,
    #[serde(default)]
    pub stats_updated_at: Option<DateTime<Utc>>,
}

impl Course {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            instructor_id: None,
            total_modules: 0,
            total_lessons: 0,
            stats_updated_at: None,
        }
    }
}

/// Module or lesson as it appears in either catalog layout. Only the fields
/// needed for counting are read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    #[serde(rename = "_firestore_id", default, skip_serializing)]
    pub id: String,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub title: String,
}

/// Actual module and lesson counts found in the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CourseContentCounts {
    pub modules: u32,
    pub lessons: u32,
}

impl CourseContentCounts {
    /// Lesson total used for progress: the live count when the catalog has
    /// one, otherwise the course's cached figure.
    pub fn effective_lessons(&self, course: &Course) -> u32 {
        if self.lessons > 0 {
            self.lessons
        } else {
            course.total_lessons
        }
    }
}
