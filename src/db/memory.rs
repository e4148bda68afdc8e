// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory document store.
//!
//! Documents are kept as JSON values so reads go through the same serde
//! migrations as Firestore reads, and legacy shapes can be seeded verbatim.
//! Writes merge into the stored object, so fields written by other clients
//! survive the way they do under a Firestore field mask. Both catalog
//! layouts are modelled: the flattened `modules`/`lessons` collections and
//! the nested `courses/{c}/modules/{m}/lessons` tree.
//! Used by the test suite and by `STORE_BACKEND=memory`.

use crate::db::{
    collections, CourseStore, LearnerDocs, LearnerTxn, ReconcileOutcome, ReconcileTxn,
    TxnDecision, TxnOutcome, UserDocs,
};
use crate::error::AppError;
use crate::models::{
    Course, CourseContentCounts, Enrollment, EnrollmentKey, Payment, User, UserProgress,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

type Collection = BTreeMap<String, Value>;

/// Nested catalog: course → module → lesson IDs.
type NestedCatalog = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

#[derive(Default)]
struct Documents {
    collections: HashMap<&'static str, Collection>,
    nested: NestedCatalog,
}

impl Documents {
    fn col(&self, name: &'static str) -> Option<&Collection> {
        self.collections.get(name)
    }

    fn col_mut(&mut self, name: &'static str) -> &mut Collection {
        self.collections.entry(name).or_default()
    }

    fn get<T: DeserializeOwned>(&self, name: &'static str, id: &str) -> Result<Option<T>, AppError> {
        match self.col(name).and_then(|c| c.get(id)) {
            Some(value) => decode(id, value).map(Some),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&mut self, name: &'static str, id: &str, doc: &T) -> Result<(), AppError> {
        let value = encode(doc)?;
        self.merge(name, id, value);
        Ok(())
    }

    /// Overwrite the fields present in `value`, keep every other stored
    /// field.
    fn merge(&mut self, name: &'static str, id: &str, value: Value) {
        let col = self.col_mut(name);
        let merged = match (col.remove(id), value) {
            (Some(Value::Object(mut stored)), Value::Object(fields)) => {
                stored.extend(fields);
                Value::Object(stored)
            }
            (_, value) => value,
        };
        col.insert(id.to_string(), merged);
    }

    /// Documents matching every `(field, value)` filter. Matches that do
    /// not decode are logged and left out.
    fn query<T: DeserializeOwned>(&self, name: &'static str, filters: &[(&str, &str)]) -> Vec<T> {
        let Some(col) = self.col(name) else {
            return Vec::new();
        };
        col.iter()
            .filter(|(_, value)| {
                filters
                    .iter()
                    .all(|(field, expected)| value.get(*field).and_then(Value::as_str) == Some(*expected))
            })
            .filter_map(|(id, value)| match decode(id, value) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    tracing::warn!(collection = name, document_id = %id, error = %e, "Skipping undecodable document");
                    None
                }
            })
            .collect()
    }

    fn load_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        Ok(self.get::<User>(collections::USERS, user_id)?.map(|mut user| {
            user.id = user_id.to_string();
            user
        }))
    }
}

fn encode<T: Serialize>(doc: &T) -> Result<Value, AppError> {
    serde_json::to_value(doc).map_err(|e| AppError::Database(format!("Failed to encode document: {e}")))
}

/// Deserialize a stored document the way Firestore hands it out, with the
/// document ID available as `_firestore_id`.
fn decode<T: DeserializeOwned>(id: &str, value: &Value) -> Result<T, AppError> {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.insert("_firestore_id".to_string(), Value::String(id.to_string()));
    }
    serde_json::from_value(value)
        .map_err(|e| AppError::MalformedDocument(format!("Failed to decode document {id}: {e}")))
}

/// Mutex-guarded document maps with fault injection.
#[derive(Default)]
pub struct InMemoryStore {
    docs: Mutex<Documents>,
    unavailable: AtomicBool,
    failing_commits: AtomicU32,
    latency_ms: AtomicU64,
    commits: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Fault injection ────────────────────────────────────────────

    /// Make every operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Abort the next `n` learner or reconciliation commits with a
    /// contention error.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of transactions that committed writes.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), AppError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamUnavailable(
                "document store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn take_commit_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    // ─── Seeding (tests and local runs) ─────────────────────────────

    /// Store a raw document, bypassing model serialization.
    pub async fn put_raw(&self, collection: &'static str, id: &str, value: Value) {
        self.docs
            .lock()
            .await
            .col_mut(collection)
            .insert(id.to_string(), value);
    }

    /// Raw stored document, for assertions.
    pub async fn raw(&self, collection: &'static str, id: &str) -> Option<Value> {
        self.docs
            .lock()
            .await
            .col(collection)
            .and_then(|c| c.get(id).cloned())
    }

    /// IDs of every document in a collection.
    pub async fn ids(&self, collection: &'static str) -> Vec<String> {
        self.docs
            .lock()
            .await
            .col(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Add a module to the flattened catalog.
    pub async fn put_module(&self, course_id: &str, module_id: &str) {
        let value = serde_json::json!({ "courseId": course_id, "title": module_id });
        self.put_raw(collections::MODULES, module_id, value).await;
    }

    /// Add a lesson to the flattened catalog.
    pub async fn put_lesson(&self, course_id: &str, module_id: &str, lesson_id: &str) {
        let value = serde_json::json!({
            "courseId": course_id,
            "moduleId": module_id,
            "title": lesson_id,
        });
        self.put_raw(collections::LESSONS, lesson_id, value).await;
    }

    /// Add a module under `courses/{course}/modules`.
    pub async fn put_nested_module(&self, course_id: &str, module_id: &str) {
        self.docs
            .lock()
            .await
            .nested
            .entry(course_id.to_string())
            .or_default()
            .entry(module_id.to_string())
            .or_default();
    }

    /// Add a lesson under `courses/{course}/modules/{module}/lessons`.
    pub async fn put_nested_lesson(&self, course_id: &str, module_id: &str, lesson_id: &str) {
        self.docs
            .lock()
            .await
            .nested
            .entry(course_id.to_string())
            .or_default()
            .entry(module_id.to_string())
            .or_default()
            .insert(lesson_id.to_string());
    }
}

#[async_trait]
impl CourseStore for InMemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        self.enter().await?;
        self.docs.lock().await.load_user(user_id)
    }

    async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        self.enter().await?;
        self.docs.lock().await.put(collections::USERS, &user.id, user)
    }

    async fn list_user_ids(&self) -> Result<Vec<String>, AppError> {
        self.enter().await?;
        Ok(self.ids(collections::USERS).await)
    }

    async fn get_course(&self, course_id: &str) -> Result<Option<Course>, AppError> {
        self.enter().await?;
        let docs = self.docs.lock().await;
        Ok(docs
            .get::<Course>(collections::COURSES, course_id)?
            .map(|mut course| {
                course.id = course_id.to_string();
                course
            }))
    }

    async fn upsert_course(&self, course: &Course) -> Result<(), AppError> {
        self.enter().await?;
        self.docs
            .lock()
            .await
            .put(collections::COURSES, &course.id, course)
    }

    async fn count_course_contents(
        &self,
        course_id: &str,
    ) -> Result<CourseContentCounts, AppError> {
        self.enter().await?;
        let docs = self.docs.lock().await;
        let ids = |name: &'static str| -> BTreeSet<String> {
            docs.col(name)
                .map(|c| {
                    c.iter()
                        .filter(|(_, v)| v.get("courseId").and_then(Value::as_str) == Some(course_id))
                        .map(|(id, _)| id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut modules = ids(collections::MODULES);
        let mut lessons = ids(collections::LESSONS);
        if let Some(tree) = docs.nested.get(course_id) {
            modules.extend(tree.keys().cloned());
            lessons.extend(tree.values().flatten().cloned());
        }
        Ok(CourseContentCounts {
            modules: modules.len() as u32,
            lessons: lessons.len() as u32,
        })
    }

    async fn get_enrollment(&self, enrollment_id: &str) -> Result<Option<Enrollment>, AppError> {
        self.enter().await?;
        self.docs
            .lock()
            .await
            .get(collections::ENROLLMENTS, enrollment_id)
    }

    async fn find_enrollments(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<Vec<Enrollment>, AppError> {
        self.enter().await?;
        Ok(self.docs.lock().await.query(
            collections::ENROLLMENTS,
            &[("userId", user_id), ("courseId", course_id)],
        ))
    }

    async fn list_user_enrollments(&self, user_id: &str) -> Result<Vec<Enrollment>, AppError> {
        self.enter().await?;
        Ok(self
            .docs
            .lock()
            .await
            .query(collections::ENROLLMENTS, &[("userId", user_id)]))
    }

    async fn get_user_progress(&self, user_id: &str) -> Result<Option<UserProgress>, AppError> {
        self.enter().await?;
        self.docs
            .lock()
            .await
            .get(collections::USER_PROGRESS, user_id)
    }

    async fn get_payment(&self, session_id: &str) -> Result<Option<Payment>, AppError> {
        self.enter().await?;
        let docs = self.docs.lock().await;
        Ok(docs
            .get::<Payment>(collections::PAYMENTS, session_id)?
            .map(|mut payment| {
                payment.id = session_id.to_string();
                payment
            }))
    }

    async fn upsert_payment(&self, payment: &Payment) -> Result<(), AppError> {
        self.enter().await?;
        self.docs
            .lock()
            .await
            .put(collections::PAYMENTS, &payment.id, payment)
    }

    async fn transact_learner(
        &self,
        key: &EnrollmentKey,
        apply: &LearnerTxn<'_>,
    ) -> Result<TxnOutcome, AppError> {
        self.enter().await?;
        // The lock is held from first read to last write, which makes this
        // serializable with respect to every other store call.
        let mut docs = self.docs.lock().await;

        let mut learner = LearnerDocs {
            user: docs.load_user(key.user_id())?,
            enrollment: docs.get(collections::ENROLLMENTS, &key.document_id())?,
            user_enrollments: docs.query(collections::ENROLLMENTS, &[("userId", key.user_id())]),
            progress: docs.get(collections::USER_PROGRESS, key.user_id())?,
            retired_enrollment_ids: Vec::new(),
        };

        if apply(&mut learner)? == TxnDecision::Skip {
            return Ok(TxnOutcome {
                docs: learner,
                committed: false,
            });
        }

        if self.take_commit_failure() {
            return Err(AppError::Database(
                "Transaction commit failed: aborted due to contention".to_string(),
            ));
        }

        // Encode everything before touching the maps so a failure leaves no
        // partial write behind.
        let mut writes: Vec<(&'static str, String, Value)> = Vec::new();
        if let Some(user) = &learner.user {
            writes.push((collections::USERS, user.id.clone(), encode(user)?));
        }
        if let Some(enrollment) = &learner.enrollment {
            writes.push((collections::ENROLLMENTS, enrollment.id.clone(), encode(enrollment)?));
        }
        if let Some(progress) = &learner.progress {
            writes.push((collections::USER_PROGRESS, key.user_id().to_string(), encode(progress)?));
        }

        for id in &learner.retired_enrollment_ids {
            docs.col_mut(collections::ENROLLMENTS).remove(id);
        }
        for (col, id, value) in writes {
            docs.merge(col, &id, value);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);

        Ok(TxnOutcome {
            docs: learner,
            committed: true,
        })
    }

    async fn transact_reconciliation(
        &self,
        user_id: &str,
        plan: &ReconcileTxn<'_>,
    ) -> Result<ReconcileOutcome, AppError> {
        self.enter().await?;
        let mut docs = self.docs.lock().await;

        let read = UserDocs {
            user: docs.load_user(user_id)?,
            enrollments: docs.query(collections::ENROLLMENTS, &[("userId", user_id)]),
            progress: docs.get(collections::USER_PROGRESS, user_id)?,
        };

        let Some(plan) = plan(&read)? else {
            return Ok(ReconcileOutcome {
                docs: read,
                committed: false,
            });
        };

        if self.take_commit_failure() {
            return Err(AppError::Database(
                "Transaction commit failed: aborted due to contention".to_string(),
            ));
        }

        let mut writes: Vec<(&'static str, String, Value)> = Vec::new();
        if let Some(user) = &plan.user {
            writes.push((collections::USERS, user_id.to_string(), encode(user)?));
        }
        for enrollment in &plan.enrollments {
            writes.push((
                collections::ENROLLMENTS,
                enrollment.id.clone(),
                encode(enrollment)?,
            ));
        }
        writes.push((
            collections::USER_PROGRESS,
            user_id.to_string(),
            encode(&plan.progress)?,
        ));

        for id in &plan.retired_enrollment_ids {
            docs.col_mut(collections::ENROLLMENTS).remove(id);
        }
        for (col, id, value) in writes {
            docs.merge(col, &id, value);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);

        Ok(ReconcileOutcome {
            docs: read,
            committed: true,
        })
    }
}
