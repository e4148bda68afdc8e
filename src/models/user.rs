// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User model for storage and API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform role. Stored upper-case; parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum Role {
    #[default]
    Student,
    Instructor,
    Admin,
    CompanyAdmin,
    CompanyEmployee,
    UniversityAdmin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Instructor => "INSTRUCTOR",
            Role::Admin => "ADMIN",
            Role::CompanyAdmin => "COMPANY_ADMIN",
            Role::CompanyEmployee => "COMPANY_EMPLOYEE",
            Role::UniversityAdmin => "UNIVERSITY_ADMIN",
        }
    }

    /// Platform administrators may run maintenance and manual enrollment.
    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }
}

impl From<String> for Role {
    /// Unknown roles degrade to the least privileged one.
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSTRUCTOR" => Role::Instructor,
            "ADMIN" => Role::Admin,
            "COMPANY_ADMIN" => Role::CompanyAdmin,
            "COMPANY_EMPLOYEE" => Role::CompanyEmployee,
            "UNIVERSITY_ADMIN" => Role::UniversityAdmin,
            _ => Role::Student,
        }
    }
}

impl From<Role> for &'static str {
    fn from(role: Role) -> Self {
        role.as_str()
    }
}

/// User profile stored in Firestore at `users/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Identity provider subject. This is the document ID; the store fills
    /// it in on read and never writes it as a field.
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Role,
    /// Legacy access flag, predates enrollment documents
    #[serde(default)]
    pub course_access: bool,
    /// Legacy redundant cache of enrolled course IDs
    #[serde(default)]
    pub enrolled_courses: Vec<String>,
    /// IANA time zone used for streak days
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    /// Minimal document for a signed-in user that has no profile yet.
    pub fn stub(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            email: None,
            display_name: None,
            role: Role::Student,
            course_access: false,
            enrolled_courses: Vec::new(),
            time_zone: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Add a course to `enrolledCourses` without duplicating it.
    ///
    /// Returns `true` if the list changed.
    pub fn add_enrolled_course(&mut self, course_id: &str) -> bool {
        if self.enrolled_courses.iter().any(|c| c == course_id) {
            return false;
        }
        self.enrolled_courses.push(course_id.to_string());
        true
    }

    pub fn lists_course(&self, course_id: &str) -> bool {
        self.enrolled_courses.iter().any(|c| c == course_id)
    }
}
