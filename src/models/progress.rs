// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user progress rollup stored at `userProgress/{userId}`.
//!
//! The rollup is denormalized from the user's enrollments and must agree
//! with them: `totalCoursesEnrolled` is the number of distinct courses the
//! user holds a granting enrollment for, and there is at most one snapshot
//! per course.

use crate::models::enrollment::Enrollment;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Dashboard snapshot of one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgressSnapshot {
    pub course_id: String,
    #[serde(default)]
    pub title: String,
    /// Whole percentage, 0-100
    #[serde(default)]
    pub percentage: u32,
    #[serde(default)]
    pub completed_lessons: u32,
    #[serde(default)]
    pub total_lessons: u32,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl CourseProgressSnapshot {
    pub fn zeroed(course_id: &str, title: &str) -> Self {
        Self {
            course_id: course_id.to_string(),
            title: title.to_string(),
            percentage: 0,
            completed_lessons: 0,
            total_lessons: 0,
            last_activity_at: None,
        }
    }

    /// Copy the figures from an enrollment.
    pub fn sync_from(&mut self, enrollment: &Enrollment, total_lessons: u32) {
        self.percentage = enrollment.percentage();
        self.completed_lessons = enrollment.completed_lessons.len() as u32;
        self.total_lessons = total_lessons.max(self.completed_lessons);
        self.last_activity_at = Some(enrollment.last_accessed_at);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProgress {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub total_courses_enrolled: u32,
    #[serde(default)]
    pub total_lessons_completed: u32,
    #[serde(default)]
    pub current_streak: u32,
    #[serde(default)]
    pub longest_streak: u32,
    /// Local calendar day of the last streak-counting activity
    #[serde(default)]
    pub last_streak_date: Option<NaiveDate>,
    #[serde(default)]
    pub enrolled_courses: Vec<CourseProgressSnapshot>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProgress {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    pub fn snapshot(&self, course_id: &str) -> Option<&CourseProgressSnapshot> {
        self.enrolled_courses.iter().find(|s| s.course_id == course_id)
    }

    /// Get the snapshot for a course, appending a zeroed one if missing.
    pub fn ensure_course(&mut self, course_id: &str, title: &str) -> &mut CourseProgressSnapshot {
        let idx = match self
            .enrolled_courses
            .iter()
            .position(|s| s.course_id == course_id)
        {
            Some(idx) => idx,
            None => {
                self.enrolled_courses
                    .push(CourseProgressSnapshot::zeroed(course_id, title));
                self.enrolled_courses.len() - 1
            }
        };
        let snapshot = &mut self.enrolled_courses[idx];
        if snapshot.title.is_empty() {
            snapshot.title = title.to_string();
        }
        snapshot
    }

    /// Drop duplicate snapshots for the same course, keeping the most
    /// advanced one. Returns the number removed.
    pub fn dedupe_snapshots(&mut self) -> usize {
        let before = self.enrolled_courses.len();
        let mut kept: Vec<CourseProgressSnapshot> = Vec::with_capacity(before);
        for snapshot in self.enrolled_courses.drain(..) {
            match kept.iter_mut().find(|s| s.course_id == snapshot.course_id) {
                Some(existing) => {
                    if snapshot.completed_lessons > existing.completed_lessons {
                        *existing = snapshot;
                    }
                }
                None => kept.push(snapshot),
            }
        }
        self.enrolled_courses = kept;
        before - self.enrolled_courses.len()
    }

    /// Update streak counters for activity on `today` (user's local day).
    pub fn bump_streak(&mut self, today: NaiveDate) {
        match self.last_streak_date {
            Some(last) if last >= today => {
                // Same day (or clock/zone skew): no change.
                if self.current_streak == 0 {
                    self.current_streak = 1;
                }
            }
            Some(last) if today.pred_opt() == Some(last) => {
                self.current_streak += 1;
                self.last_streak_date = Some(today);
            }
            _ => {
                self.current_streak = 1;
                self.last_streak_date = Some(today);
            }
        }
        self.longest_streak = self.longest_streak.max(self.current_streak);
    }

    /// Recompute the course and lesson totals from granting enrollments.
    pub fn recount<'a>(&mut self, enrollments: impl IntoIterator<Item = &'a Enrollment>) {
        let mut courses = BTreeSet::new();
        let mut lessons = 0u32;
        for enrollment in enrollments {
            if enrollment.status.grants_access() && courses.insert(enrollment.course_id.clone()) {
                lessons += enrollment.completed_lessons.len() as u32;
            }
        }
        self.total_courses_enrolled = courses.len() as u32;
        self.total_lessons_completed = lessons;
    }
}
