// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Payment record for a processor checkout session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    /// pending → completed | failed; completed is terminal. A failed
    /// session may still complete (delayed payment methods).
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        match (self, next) {
            (PaymentStatus::Completed, _) => false,
            (PaymentStatus::Pending, PaymentStatus::Completed | PaymentStatus::Failed) => true,
            (PaymentStatus::Failed, PaymentStatus::Completed) => true,
            _ => false,
        }
    }
}

impl From<String> for PaymentStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "completed" | "succeeded" | "paid" => PaymentStatus::Completed,
            "failed" | "expired" | "canceled" | "cancelled" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }
}

impl From<PaymentStatus> for &'static str {
    fn from(status: PaymentStatus) -> Self {
        status.as_str()
    }
}

/// Stored at `payments/{sessionId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    /// Processor session ID (document ID), filled in by the store on read.
    #[serde(default, skip_serializing)]
    pub id: String,
    pub user_id: String,
    pub course_id: String,
    /// Amount in minor currency units
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    pub status: PaymentStatus,
    /// Whether this payment has granted course access
    #[serde(default)]
    pub course_access: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn pending(
        session_id: &str,
        user_id: &str,
        course_id: &str,
        amount: i64,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: session_id.to_string(),
            user_id: user_id.to_string(),
            course_id: course_id.to_string(),
            amount,
            currency: currency.to_ascii_lowercase(),
            status: PaymentStatus::Pending,
            course_access: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change if allowed. Returns `true` if it changed.
    pub fn transition(&mut self, next: PaymentStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.course_access = next == PaymentStatus::Completed;
        self.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_is_terminal() {
        let now = Utc::now();
        let mut payment = Payment::pending("sess_1", "u1", "course-x", 4990000, "HUF", now);
        assert_eq!(payment.currency, "huf");

        assert!(payment.transition(PaymentStatus::Completed, now));
        assert!(payment.course_access);
        assert!(!payment.transition(PaymentStatus::Failed, now));
        assert!(!payment.transition(PaymentStatus::Pending, now));
        assert_eq!(payment.status, PaymentStatus::Completed);
    }

    #[test]
    fn test_failed_can_still_complete() {
        let now = Utc::now();
        let mut payment = Payment::pending("sess_2", "u1", "course-x", 100, "eur", now);
        assert!(payment.transition(PaymentStatus::Failed, now));
        assert!(!payment.course_access);
        assert!(payment.transition(PaymentStatus::Completed, now));
    }

    #[test]
    fn test_status_aliases() {
        let status: PaymentStatus = serde_json::from_value(serde_json::json!("succeeded")).unwrap();
        assert_eq!(status, PaymentStatus::Completed);
        assert_eq!(
            serde_json::to_value(PaymentStatus::Failed).unwrap(),
            "failed"
        );
    }
}
