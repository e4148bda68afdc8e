// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - enrollment and access business logic.

pub mod access;
pub mod enrollment;
pub mod firebase_auth;
pub mod functions;
pub mod payment;
pub mod progress;
pub mod reconcile;

pub use access::{AccessCache, AccessDecision, AccessReason, AccessResolver};
pub use enrollment::{EnrollmentWriter, GrantOutcome};
pub use firebase_auth::{AuthError, FirebaseTokenVerifier, VerifiedIdentity};
pub use functions::{FunctionsClient, UpstreamResponse};
pub use payment::{CheckoutFulfiller, FulfillmentOutcome, ProcessorEvent};
pub use progress::{LessonCompletion, ProgressAggregator};
pub use reconcile::{CourseStatsReport, ReconcileReport, ReconcileSummary, Reconciler};
