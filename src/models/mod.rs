// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod course;
pub mod enrollment;
pub mod payment;
pub mod progress;
pub mod user;

pub use course::{CatalogEntry, Course, CourseContentCounts};
pub use enrollment::{Enrollment, EnrollmentKey, EnrollmentStatus};
pub use payment::{Payment, PaymentStatus};
pub use progress::{CourseProgressSnapshot, UserProgress};
pub use user::{Role, User};
