// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides high-level operations for:
//! - Users (profiles, legacy access flags)
//! - Courses and the module/lesson catalog (both layouts)
//! - Enrollments (canonical and legacy IDs)
//! - User progress rollups
//! - Payments

use crate::db::{
    collections, CourseStore, LearnerDocs, LearnerTxn, ReconcileOutcome, ReconcileTxn,
    TxnDecision, TxnOutcome, UserDocs,
};
use crate::error::AppError;
use crate::models::{
    CatalogEntry, Course, CourseContentCounts, Enrollment, EnrollmentKey, Payment, User,
    UserProgress,
};
use async_trait::async_trait;
use firestore::errors::FirestoreError;
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use std::collections::BTreeSet;

const MAX_CONCURRENT_DB_OPS: usize = 16;

/// Field masks for collections other clients write too. Updates only
/// replace the fields the model knows; profile fields, processor IDs and
/// the like are left alone.
mod field_masks {
    pub const USER: &[&str] = &[
        "email",
        "displayName",
        "role",
        "courseAccess",
        "enrolledCourses",
        "timeZone",
        "createdAt",
        "updatedAt",
    ];
    pub const COURSE: &[&str] = &[
        "title",
        "instructorId",
        "totalModules",
        "totalLessons",
        "statsUpdatedAt",
    ];
    pub const USER_PROGRESS: &[&str] = &[
        "userId",
        "totalCoursesEnrolled",
        "totalLessonsCompleted",
        "currentStreak",
        "longestStreak",
        "lastStreakDate",
        "enrolledCourses",
        "updatedAt",
    ];
    pub const PAYMENT: &[&str] = &[
        "userId",
        "courseId",
        "amount",
        "currency",
        "status",
        "courseAccess",
        "createdAt",
        "updatedAt",
    ];
}

/// A document that does not fit its model will not fit on retry either.
fn read_error(context: &str, e: FirestoreError) -> AppError {
    match e {
        FirestoreError::DeserializeError(_) => {
            AppError::MalformedDocument(format!("{context}: {e}"))
        }
        _ => AppError::Database(format!("{context}: {e}")),
    }
}

/// Projection used when only document IDs are needed.
#[derive(Debug, Deserialize)]
struct DocId {
    #[serde(rename = "_firestore_id")]
    id: String,
}

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        // If the emulator environment variable is set, use unauthenticated connection
        // to avoid local credential warnings and leakage.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a mock Firestore client for testing (offline mode).
    ///
    /// All database operations fail as unavailable.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb, AppError> {
        self.client.as_ref().ok_or_else(|| {
            AppError::UpstreamUnavailable("Database not connected (offline mode)".to_string())
        })
    }

    /// Enrollments of one user, optionally narrowed to one course.
    ///
    /// Documents are decoded one at a time so a single malformed record
    /// (older write paths left some without a `courseId`) is logged and
    /// left out instead of failing every operation on this user.
    async fn query_enrollments(
        client: &firestore::FirestoreDb,
        user_id: &str,
        course_id: Option<&str>,
    ) -> Result<Vec<Enrollment>, AppError> {
        let docs = client
            .fluent()
            .select()
            .from(collections::ENROLLMENTS)
            .filter(|q| {
                q.for_all([
                    q.field("userId").eq(user_id),
                    course_id.and_then(|c| q.field("courseId").eq(c)),
                ])
            })
            .query()
            .await
            .map_err(|e| AppError::Database(format!("Failed to query enrollments: {}", e)))?;

        Ok(docs
            .iter()
            .filter_map(
                |doc| match firestore::FirestoreDb::deserialize_doc_to::<Enrollment>(doc) {
                    Ok(enrollment) => Some(enrollment),
                    Err(e) => {
                        tracing::warn!(document = %doc.name, error = %e, "Skipping undecodable enrollment");
                        None
                    }
                },
            )
            .collect())
    }

    /// Read everything reconciliation looks at for one user through
    /// `client`, which may be bound to a transaction.
    async fn read_user_docs(
        client: &firestore::FirestoreDb,
        user_id: &str,
    ) -> Result<UserDocs, AppError> {
        let user: Option<User> = client
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| read_error("Failed to read user", e))?;

        let enrollments = Self::query_enrollments(client, user_id, None).await?;

        let progress: Option<UserProgress> = client
            .fluent()
            .select()
            .by_id_in(collections::USER_PROGRESS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| read_error("Failed to read progress", e))?;

        Ok(UserDocs {
            user: user.map(|mut u| {
                u.id = user_id.to_string();
                u
            }),
            enrollments,
            progress,
        })
    }

    /// Read a learner's documents through `client`, which may be bound to
    /// a transaction.
    async fn read_learner(
        client: &firestore::FirestoreDb,
        key: &EnrollmentKey,
    ) -> Result<LearnerDocs, AppError> {
        let enrollment: Option<Enrollment> = client
            .fluent()
            .select()
            .by_id_in(collections::ENROLLMENTS)
            .obj()
            .one(&key.document_id())
            .await
            .map_err(|e| read_error("Failed to read enrollment", e))?;

        let UserDocs {
            user,
            enrollments,
            progress,
        } = Self::read_user_docs(client, key.user_id()).await?;

        Ok(LearnerDocs {
            user,
            enrollment,
            user_enrollments: enrollments,
            progress,
            retired_enrollment_ids: Vec::new(),
        })
    }

    /// Collect catalog entry IDs under a nested parent path.
    async fn nested_ids(
        client: &firestore::FirestoreDb,
        parent: &firestore::ParentPathBuilder,
        collection: &str,
    ) -> Result<Vec<String>, AppError> {
        let entries: Vec<CatalogEntry> = client
            .fluent()
            .select()
            .from(collection)
            .parent(parent)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(entries.into_iter().map(|e| e.id).collect())
    }
}

#[async_trait]
impl CourseStore for FirestoreDb {
    // ─── User Operations ─────────────────────────────────────────

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        let user: Option<User> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| read_error("Failed to read user", e))?;
        Ok(user.map(|mut u| {
            u.id = user_id.to_string();
            u
        }))
    }

    async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .fields(field_masks::USER)
            .in_col(collections::USERS)
            .document_id(&user.id)
            .object(user)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_user_ids(&self) -> Result<Vec<String>, AppError> {
        let docs: Vec<DocId> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(docs.into_iter().map(|d| d.id).collect())
    }

    // ─── Catalog Operations ──────────────────────────────────────

    async fn get_course(&self, course_id: &str) -> Result<Option<Course>, AppError> {
        let course: Option<Course> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::COURSES)
            .obj()
            .one(course_id)
            .await
            .map_err(|e| read_error("Failed to read course", e))?;
        Ok(course.map(|mut c| {
            c.id = course_id.to_string();
            c
        }))
    }

    async fn upsert_course(&self, course: &Course) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .fields(field_masks::COURSE)
            .in_col(collections::COURSES)
            .document_id(&course.id)
            .object(course)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Both catalog generations can hold entries for the same course, so
    /// IDs are unioned across the flattened collections and the nested
    /// `courses/{c}/modules/{m}/lessons` tree.
    async fn count_course_contents(
        &self,
        course_id: &str,
    ) -> Result<CourseContentCounts, AppError> {
        let client = self.get_client()?;

        let flat_modules: Vec<CatalogEntry> = client
            .fluent()
            .select()
            .from(collections::MODULES)
            .filter(|q| q.for_all([q.field("courseId").eq(course_id)]))
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let flat_lessons: Vec<CatalogEntry> = client
            .fluent()
            .select()
            .from(collections::LESSONS)
            .filter(|q| q.for_all([q.field("courseId").eq(course_id)]))
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let course_path = client
            .parent_path(collections::COURSES, course_id)
            .map_err(|e| AppError::Database(e.to_string()))?;
        let nested_modules = Self::nested_ids(client, &course_path, collections::MODULES).await?;

        let nested_lessons: Vec<Vec<String>> = stream::iter(nested_modules.clone())
            .map(|module_id| {
                let course_path = course_path.clone();
                async move {
                    let module_path = course_path
                        .at(collections::MODULES, &module_id)
                        .map_err(|e| AppError::Database(e.to_string()))?;
                    Self::nested_ids(client, &module_path, collections::LESSONS).await
                }
            })
            .buffer_unordered(MAX_CONCURRENT_DB_OPS)
            .try_collect()
            .await?;

        let modules: BTreeSet<String> = flat_modules
            .into_iter()
            .map(|e| e.id)
            .chain(nested_modules)
            .collect();
        let lessons: BTreeSet<String> = flat_lessons
            .into_iter()
            .map(|e| e.id)
            .chain(nested_lessons.into_iter().flatten())
            .collect();

        Ok(CourseContentCounts {
            modules: modules.len() as u32,
            lessons: lessons.len() as u32,
        })
    }

    // ─── Enrollment Operations ───────────────────────────────────

    async fn get_enrollment(&self, enrollment_id: &str) -> Result<Option<Enrollment>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::ENROLLMENTS)
            .obj()
            .one(enrollment_id)
            .await
            .map_err(|e| read_error("Failed to read enrollment", e))
    }

    async fn find_enrollments(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<Vec<Enrollment>, AppError> {
        Self::query_enrollments(self.get_client()?, user_id, Some(course_id)).await
    }

    async fn list_user_enrollments(&self, user_id: &str) -> Result<Vec<Enrollment>, AppError> {
        Self::query_enrollments(self.get_client()?, user_id, None).await
    }

    // ─── Progress / Payment Operations ───────────────────────────

    async fn get_user_progress(&self, user_id: &str) -> Result<Option<UserProgress>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USER_PROGRESS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| read_error("Failed to read progress", e))
    }

    async fn get_payment(&self, session_id: &str) -> Result<Option<Payment>, AppError> {
        let payment: Option<Payment> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::PAYMENTS)
            .obj()
            .one(session_id)
            .await
            .map_err(|e| read_error("Failed to read payment", e))?;
        Ok(payment.map(|mut p| {
            p.id = session_id.to_string();
            p
        }))
    }

    async fn upsert_payment(&self, payment: &Payment) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .fields(field_masks::PAYMENT)
            .in_col(collections::PAYMENTS)
            .document_id(&payment.id)
            .object(payment)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    // ─── Atomic Learner Updates ──────────────────────────────────

    /// Reads go through a client bound to the transaction so Firestore
    /// registers them for conflict detection. If another writer touches any
    /// of these documents before commit, the commit fails and the caller's
    /// retry loop runs the closure again on fresh data.
    async fn transact_learner(
        &self,
        key: &EnrollmentKey,
        apply: &LearnerTxn<'_>,
    ) -> Result<TxnOutcome, AppError> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

        let tx_client = client.clone_with_consistency_selector(
            firestore::FirestoreConsistencySelector::Transaction(
                transaction.transaction_id().clone(),
            ),
        );

        let mut docs = match Self::read_learner(&tx_client, key).await {
            Ok(docs) => docs,
            Err(e) => {
                let _ = transaction.rollback().await;
                return Err(e);
            }
        };

        let decision = match apply(&mut docs) {
            Ok(decision) => decision,
            Err(e) => {
                let _ = transaction.rollback().await;
                return Err(e);
            }
        };

        if decision == TxnDecision::Skip {
            let _ = transaction.rollback().await;
            return Ok(TxnOutcome {
                docs,
                committed: false,
            });
        }

        if let Some(user) = &docs.user {
            client
                .fluent()
                .update()
                .fields(field_masks::USER)
                .in_col(collections::USERS)
                .document_id(key.user_id())
                .object(user)
                .add_to_transaction(&mut transaction)
                .map_err(|e| {
                    AppError::Database(format!("Failed to add user to transaction: {}", e))
                })?;
        }

        if let Some(enrollment) = &docs.enrollment {
            client
                .fluent()
                .update()
                .in_col(collections::ENROLLMENTS)
                .document_id(&enrollment.id)
                .object(enrollment)
                .add_to_transaction(&mut transaction)
                .map_err(|e| {
                    AppError::Database(format!("Failed to add enrollment to transaction: {}", e))
                })?;
        }

        if let Some(progress) = &docs.progress {
            client
                .fluent()
                .update()
                .fields(field_masks::USER_PROGRESS)
                .in_col(collections::USER_PROGRESS)
                .document_id(key.user_id())
                .object(progress)
                .add_to_transaction(&mut transaction)
                .map_err(|e| {
                    AppError::Database(format!("Failed to add progress to transaction: {}", e))
                })?;
        }

        for retired in &docs.retired_enrollment_ids {
            client
                .fluent()
                .delete()
                .from(collections::ENROLLMENTS)
                .document_id(retired)
                .add_to_transaction(&mut transaction)
                .map_err(|e| {
                    AppError::Database(format!("Failed to add deletion to transaction: {}", e))
                })?;
        }

        transaction
            .commit()
            .await
            .map_err(|e| AppError::Database(format!("Transaction commit failed: {}", e)))?;

        tracing::debug!(
            user_id = key.user_id(),
            course_id = key.course_id(),
            retired = docs.retired_enrollment_ids.len(),
            "Learner transaction committed"
        );

        Ok(TxnOutcome {
            docs,
            committed: true,
        })
    }

    /// Same read discipline as [`Self::transact_learner`]: a lesson
    /// completion or grant that commits between these reads and the
    /// commit aborts it, and the caller plans again from fresh data.
    async fn transact_reconciliation(
        &self,
        user_id: &str,
        plan: &ReconcileTxn<'_>,
    ) -> Result<ReconcileOutcome, AppError> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

        let tx_client = client.clone_with_consistency_selector(
            firestore::FirestoreConsistencySelector::Transaction(
                transaction.transaction_id().clone(),
            ),
        );

        let docs = match Self::read_user_docs(&tx_client, user_id).await {
            Ok(docs) => docs,
            Err(e) => {
                let _ = transaction.rollback().await;
                return Err(e);
            }
        };

        let plan = match plan(&docs) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                let _ = transaction.rollback().await;
                return Ok(ReconcileOutcome {
                    docs,
                    committed: false,
                });
            }
            Err(e) => {
                let _ = transaction.rollback().await;
                return Err(e);
            }
        };

        if let Some(user) = &plan.user {
            client
                .fluent()
                .update()
                .fields(field_masks::USER)
                .in_col(collections::USERS)
                .document_id(user_id)
                .object(user)
                .add_to_transaction(&mut transaction)
                .map_err(|e| {
                    AppError::Database(format!("Failed to add user to transaction: {}", e))
                })?;
        }

        for enrollment in &plan.enrollments {
            client
                .fluent()
                .update()
                .in_col(collections::ENROLLMENTS)
                .document_id(&enrollment.id)
                .object(enrollment)
                .add_to_transaction(&mut transaction)
                .map_err(|e| {
                    AppError::Database(format!("Failed to add enrollment to transaction: {}", e))
                })?;
        }

        for retired in &plan.retired_enrollment_ids {
            client
                .fluent()
                .delete()
                .from(collections::ENROLLMENTS)
                .document_id(retired)
                .add_to_transaction(&mut transaction)
                .map_err(|e| {
                    AppError::Database(format!("Failed to add deletion to transaction: {}", e))
                })?;
        }

        client
            .fluent()
            .update()
            .fields(field_masks::USER_PROGRESS)
            .in_col(collections::USER_PROGRESS)
            .document_id(user_id)
            .object(&plan.progress)
            .add_to_transaction(&mut transaction)
            .map_err(|e| {
                AppError::Database(format!("Failed to add progress to transaction: {}", e))
            })?;

        transaction
            .commit()
            .await
            .map_err(|e| AppError::Database(format!("Failed to commit reconciliation: {}", e)))?;

        Ok(ReconcileOutcome {
            docs,
            committed: true,
        })
    }
}
