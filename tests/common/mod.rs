// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::{
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use course_enrollment::config::Config;
use course_enrollment::db::{CourseStore, FirestoreDb, InMemoryStore};
use course_enrollment::middleware::create_session_token;
use course_enrollment::models::{Course, Role, User};
use course_enrollment::routes::create_router;
use course_enrollment::AppState;
use serde_json::{json, Value};
use std::sync::Arc;

/// Signature the fake upstream verifier accepts.
#[allow(dead_code)]
pub const VALID_SIGNATURE: &str = "t=1700000000,v1=valid";

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Create a test app on a fresh in-memory store.
/// Returns the router, the shared state and the store for seeding.
#[allow(dead_code)]
pub fn create_test_app() -> (Router, Arc<AppState>, Arc<InMemoryStore>) {
    create_test_app_with(Config::test_default())
}

#[allow(dead_code)]
pub fn create_test_app_with(config: Config) -> (Router, Arc<AppState>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let state = Arc::new(
        AppState::new(config, store.clone()).expect("Failed to build test app state"),
    );
    (create_router(state.clone()), state, store)
}

/// Session token for `uid`, signed with the test shared secret.
#[allow(dead_code)]
pub fn test_token(state: &AppState, uid: &str) -> String {
    let secret = state
        .config
        .auth_shared_secret
        .as_deref()
        .expect("test config has a shared secret");
    create_session_token(uid, None, &state.config.gcp_project_id, secret)
        .expect("Failed to mint test token")
}

/// Add a course with `lessons` lessons spread over one module.
#[allow(dead_code)]
pub async fn seed_course(store: &InMemoryStore, course_id: &str, title: &str, lessons: u32) {
    store
        .upsert_course(&Course::new(course_id, title))
        .await
        .expect("Failed to seed course");
    if lessons > 0 {
        let module_id = format!("{course_id}-m1");
        store.put_module(course_id, &module_id).await;
        for n in 1..=lessons {
            store
                .put_lesson(course_id, &module_id, &format!("{course_id}-l{n}"))
                .await;
        }
    }
}

#[allow(dead_code)]
pub async fn seed_user(store: &InMemoryStore, uid: &str, role: Role) -> User {
    let mut user = User::stub(uid, chrono::Utc::now());
    user.role = role;
    user.email = Some(format!("{uid}@example.hu"));
    store.upsert_user(&user).await.expect("Failed to seed user");
    user
}

/// Start a stand-in for the upstream `stripeWebhook` function on an
/// ephemeral port and return its base URL.
///
/// It answers 200 `{"received": true}` for [`VALID_SIGNATURE`] and 400
/// otherwise, like the real verifier.
#[allow(dead_code)]
pub async fn spawn_fake_functions() -> String {
    async fn stripe_webhook(headers: HeaderMap) -> (StatusCode, Json<Value>) {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if signature == VALID_SIGNATURE {
            (StatusCode::OK, Json(json!({ "received": true })))
        } else {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Webhook signature verification failed" })),
            )
        }
    }

    let app = Router::new().route("/stripeWebhook", post(stripe_webhook));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind fake upstream");
    let addr = listener.local_addr().expect("fake upstream address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Test app whose functions base URL points at a fresh fake upstream.
#[allow(dead_code)]
pub async fn create_webhook_test_app() -> (Router, Arc<AppState>, Arc<InMemoryStore>) {
    let mut config = Config::test_default();
    config.functions_base_url = spawn_fake_functions().await;
    create_test_app_with(config)
}

/// A `checkout.session.completed` event body.
#[allow(dead_code)]
pub fn checkout_completed(session_id: &str, user_id: &str, course_id: &str) -> Value {
    json!({
        "id": format!("evt_{session_id}"),
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": session_id,
                "metadata": { "userId": user_id, "courseId": course_id },
                "amount_total": 4990000,
                "currency": "huf",
                "payment_status": "paid"
            }
        }
    })
}
