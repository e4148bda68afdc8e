// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Checkout fulfilment for verified processor events.

use crate::db::{with_timeout, CourseStore};
use crate::error::AppError;
use crate::models::enrollment::validate_id;
use crate::models::{Payment, PaymentStatus};
use crate::retry::{retry_transient, RetryPolicy};
use crate::services::enrollment::EnrollmentWriter;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_ASYNC_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const CHECKOUT_EXPIRED: &str = "checkout.session.expired";
pub const CHECKOUT_ASYNC_FAILED: &str = "checkout.session.async_payment_failed";

/// Processor event envelope; only the parts fulfilment reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: CheckoutSession,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`. Delayed payment methods
    /// complete the session while still `unpaid`.
    #[serde(default)]
    pub payment_status: Option<String>,
}

impl CheckoutSession {
    fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid") | Some("no_payment_required")
        )
    }

    fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// What fulfilment did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    Fulfilled { enrollment_id: String, created: bool },
    AlreadyFulfilled,
    /// Session completed but the money has not arrived; recorded as pending
    AwaitingPayment,
    MarkedFailed,
    Ignored(String),
}

pub struct CheckoutFulfiller {
    store: Arc<dyn CourseStore>,
    enrollments: Arc<EnrollmentWriter>,
    retry: RetryPolicy,
    store_timeout: Duration,
}

impl CheckoutFulfiller {
    pub fn new(
        store: Arc<dyn CourseStore>,
        enrollments: Arc<EnrollmentWriter>,
        retry: RetryPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            enrollments,
            retry,
            store_timeout,
        }
    }

    pub async fn handle_event(&self, event: &ProcessorEvent) -> Result<FulfillmentOutcome, AppError> {
        match event.event_type.as_str() {
            CHECKOUT_COMPLETED if event.data.object.is_paid() => {
                self.fulfil(&event.data.object).await
            }
            CHECKOUT_COMPLETED => self.await_payment(&event.data.object).await,
            CHECKOUT_ASYNC_SUCCEEDED => self.fulfil(&event.data.object).await,
            CHECKOUT_EXPIRED | CHECKOUT_ASYNC_FAILED => {
                self.mark_failed(&event.data.object).await
            }
            other => {
                tracing::debug!(event_type = other, "Ignoring processor event");
                Ok(FulfillmentOutcome::Ignored(format!(
                    "unhandled event type {other}"
                )))
            }
        }
    }

    async fn fulfil(&self, session: &CheckoutSession) -> Result<FulfillmentOutcome, AppError> {
        let session_id = validate_id("sessionId", &session.id)?;
        let (Some(user_id), Some(course_id)) =
            (session.metadata("userId"), session.metadata("courseId"))
        else {
            tracing::warn!(
                payment_session_id = session_id,
                "Checkout session without userId/courseId metadata"
            );
            return Ok(FulfillmentOutcome::Ignored(
                "missing userId or courseId metadata".to_string(),
            ));
        };

        let existing = self.load_payment(session_id).await?;
        if existing
            .as_ref()
            .is_some_and(|p| p.status == PaymentStatus::Completed)
        {
            tracing::info!(
                payment_session_id = session_id,
                user_id,
                course_id,
                "Payment already fulfilled"
            );
            return Ok(FulfillmentOutcome::AlreadyFulfilled);
        }

        let now = Utc::now();
        let mut payment = existing.unwrap_or_else(|| {
            Payment::pending(
                session_id,
                user_id,
                course_id,
                session.amount_total.unwrap_or_default(),
                session.currency.as_deref().unwrap_or_default(),
                now,
            )
        });
        if payment.status == PaymentStatus::Pending {
            self.save_payment(&payment).await?;
        }

        let grant = self
            .enrollments
            .grant_enrollment(user_id, course_id, Some(session_id))
            .await?;

        payment.transition(PaymentStatus::Completed, Utc::now());
        self.save_payment(&payment).await?;

        tracing::info!(
            payment_session_id = session_id,
            user_id,
            course_id,
            enrollment_id = %grant.enrollment.id,
            created = grant.created,
            "Checkout fulfilled"
        );

        Ok(FulfillmentOutcome::Fulfilled {
            enrollment_id: grant.enrollment.id,
            created: grant.created,
        })
    }

    /// Record an unpaid completed session as pending. The grant waits for
    /// the async success event.
    async fn await_payment(&self, session: &CheckoutSession) -> Result<FulfillmentOutcome, AppError> {
        let session_id = validate_id("sessionId", &session.id)?;
        let (Some(user_id), Some(course_id)) =
            (session.metadata("userId"), session.metadata("courseId"))
        else {
            return Ok(FulfillmentOutcome::Ignored(
                "missing userId or courseId metadata".to_string(),
            ));
        };

        match self.load_payment(session_id).await? {
            Some(existing) if existing.status == PaymentStatus::Pending => {
                return Ok(FulfillmentOutcome::AwaitingPayment);
            }
            Some(existing) => {
                return Ok(FulfillmentOutcome::Ignored(format!(
                    "payment already {}",
                    existing.status.as_str()
                )));
            }
            None => {}
        }

        let payment = Payment::pending(
            session_id,
            user_id,
            course_id,
            session.amount_total.unwrap_or_default(),
            session.currency.as_deref().unwrap_or_default(),
            Utc::now(),
        );
        self.save_payment(&payment).await?;
        tracing::info!(
            payment_session_id = session_id,
            user_id,
            course_id,
            payment_status = session.payment_status.as_deref().unwrap_or("<none>"),
            "Checkout completed without payment, awaiting async result"
        );
        Ok(FulfillmentOutcome::AwaitingPayment)
    }

    async fn mark_failed(&self, session: &CheckoutSession) -> Result<FulfillmentOutcome, AppError> {
        let session_id = validate_id("sessionId", &session.id)?;
        let now = Utc::now();

        let payment = match self.load_payment(session_id).await? {
            Some(payment) => Some(payment),
            None => match (session.metadata("userId"), session.metadata("courseId")) {
                (Some(user_id), Some(course_id)) => Some(Payment::pending(
                    session_id,
                    user_id,
                    course_id,
                    session.amount_total.unwrap_or_default(),
                    session.currency.as_deref().unwrap_or_default(),
                    now,
                )),
                _ => None,
            },
        };

        let Some(mut payment) = payment else {
            return Ok(FulfillmentOutcome::Ignored(
                "no payment record and no metadata".to_string(),
            ));
        };

        if !payment.transition(PaymentStatus::Failed, now) {
            return Ok(FulfillmentOutcome::Ignored(format!(
                "payment already {}",
                payment.status.as_str()
            )));
        }
        self.save_payment(&payment).await?;
        tracing::info!(payment_session_id = session_id, "Payment marked failed");
        Ok(FulfillmentOutcome::MarkedFailed)
    }

    async fn load_payment(&self, session_id: &str) -> Result<Option<Payment>, AppError> {
        with_timeout(self.store_timeout, self.store.get_payment(session_id)).await
    }

    async fn save_payment(&self, payment: &Payment) -> Result<(), AppError> {
        retry_transient(self.retry, || {
            with_timeout(self.store_timeout, self.store.upsert_payment(payment))
        })
        .await
        .map(|_| ())
        .map_err(|(e, attempts)| {
            tracing::error!(
                payment_session_id = %payment.id,
                user_id = %payment.user_id,
                course_id = %payment.course_id,
                attempts,
                error = %e,
                "Failed to write payment record"
            );
            if e.is_transient() {
                AppError::WriteFailed(format!("payment {} not written: {}", payment.id, e))
            } else {
                e
            }
        })
    }
}
