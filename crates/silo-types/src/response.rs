//! Responses and the structured failure taxonomy.
//!
//! Every failure carries a category that decides its retry treatment:
//! `Transient` retries per policy, `System` retries at most once, and the
//! rest surface immediately.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Classification of a failure, carried on every failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCategory {
    /// Validation, not-found, conflict; never retried.
    Logical,
    /// Network, timeout, backpressure; retried per policy.
    Transient,
    /// Authentication, authorization, WORM; audited, never retried.
    Security,
    /// Unexpected defect; retried at most once.
    System,
    /// Rate limited; surfaced with a retry-after hint.
    Quota,
}

impl FailureCategory {
    /// Whether a failure of this category may be retried at all.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureCategory::Transient | FailureCategory::System)
    }

    /// Hard ceiling on retry attempts regardless of policy.
    ///
    /// `None` means the policy's own `max_attempts` governs.
    pub fn retry_ceiling(self) -> Option<u32> {
        match self {
            FailureCategory::System => Some(1),
            FailureCategory::Transient => None,
            _ => Some(0),
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureCategory::Logical => "Logical",
            FailureCategory::Transient => "Transient",
            FailureCategory::Security => "Security",
            FailureCategory::System => "System",
            FailureCategory::Quota => "Quota",
        };
        f.write_str(name)
    }
}

/// A structured failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Stable machine-readable code, e.g. `NotLeader` or `WormViolation`.
    pub error_code: String,
    /// Retry classification.
    pub category: FailureCategory,
    /// Closest HTTP status equivalent for edge surfaces.
    pub http_status: u16,
    /// Human-readable one-line title.
    pub title: String,
    /// Optional link to problem documentation.
    pub detail_uri: Option<String>,
    /// Optional link to the specific occurrence.
    pub instance_uri: Option<String>,
}

impl Failure {
    /// Build a failure with an explicit category and its default status.
    pub fn new(
        category: FailureCategory,
        error_code: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let http_status = match category {
            FailureCategory::Logical => 400,
            FailureCategory::Transient => 503,
            FailureCategory::Security => 403,
            FailureCategory::System => 500,
            FailureCategory::Quota => 429,
        };
        Self {
            error_code: error_code.into(),
            category,
            http_status,
            title: title.into(),
            detail_uri: None,
            instance_uri: None,
        }
    }

    /// Validation, not-found, conflict.
    pub fn logical(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(FailureCategory::Logical, code, title)
    }

    /// Network, timeout, backpressure.
    pub fn transient(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(FailureCategory::Transient, code, title)
    }

    /// Authentication, authorization, retention.
    pub fn security(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(FailureCategory::Security, code, title)
    }

    /// Unexpected defect.
    pub fn system(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(FailureCategory::System, code, title)
    }

    /// Rate limited.
    pub fn quota(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(FailureCategory::Quota, code, title)
    }

    /// Override the HTTP status equivalent.
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = status;
        self
    }

    /// Attach a documentation link.
    pub fn with_detail_uri(mut self, uri: impl Into<String>) -> Self {
        self.detail_uri = Some(uri.into());
        self
    }

    /// Attach an occurrence link.
    pub fn with_instance_uri(mut self, uri: impl Into<String>) -> Self {
        self.instance_uri = Some(uri.into());
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.error_code, self.category, self.title)
    }
}

/// Outcome of a single dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The handler completed; the payload is the (optionally empty) result.
    Success {
        /// Opaque result bytes; `None` for fire-and-forget acknowledgements.
        #[serde(skip)]
        payload: Option<Bytes>,
    },
    /// The handler or a middleware produced a structured failure.
    Failure(Failure),
    /// The dispatch was cancelled before completion. Not a retryable failure.
    Cancelled,
}

impl Response {
    /// Success without a payload.
    pub fn ok() -> Self {
        Response::Success { payload: None }
    }

    /// Success carrying result bytes.
    pub fn with_payload(payload: Bytes) -> Self {
        Response::Success {
            payload: Some(payload),
        }
    }

    /// Whether this is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Response::Failure(f) => Some(f),
            _ => None,
        }
    }
}

impl From<Failure> for Response {
    fn from(failure: Failure) -> Self {
        Response::Failure(failure)
    }
}

/// Aggregate result of a batched dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Per-item outcomes in submission order.
    pub items: Vec<Response>,
    /// Count of successful items.
    pub succeeded: usize,
    /// Count of failed or cancelled items.
    pub failed: usize,
}

impl BatchResponse {
    /// Aggregate a list of per-item responses.
    pub fn from_items(items: Vec<Response>) -> Self {
        let succeeded = items.iter().filter(|r| r.is_success()).count();
        let failed = items.len() - succeeded;
        Self {
            items,
            succeeded,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_retry_rules() {
        assert!(FailureCategory::Transient.is_retryable());
        assert!(FailureCategory::System.is_retryable());
        assert_eq!(FailureCategory::System.retry_ceiling(), Some(1));
        assert_eq!(FailureCategory::Transient.retry_ceiling(), None);
        for cat in [
            FailureCategory::Logical,
            FailureCategory::Security,
            FailureCategory::Quota,
        ] {
            assert!(!cat.is_retryable());
            assert_eq!(cat.retry_ceiling(), Some(0));
        }
    }

    #[test]
    fn default_http_status_follows_category() {
        assert_eq!(Failure::logical("BadInput", "t").http_status, 400);
        assert_eq!(Failure::transient("Timeout", "t").http_status, 503);
        assert_eq!(Failure::security("Unauthorized", "t").http_status, 403);
        assert_eq!(Failure::system("Panic", "t").http_status, 500);
        assert_eq!(Failure::quota("RateLimited", "t").http_status, 429);
        assert_eq!(
            Failure::logical("NotFound", "t").with_status(404).http_status,
            404
        );
    }

    #[test]
    fn batch_counts_add_up() {
        let batch = BatchResponse::from_items(vec![
            Response::ok(),
            Response::Failure(Failure::logical("NotFound", "missing")),
            Response::Cancelled,
        ]);
        assert_eq!(batch.succeeded, 1);
        assert_eq!(batch.failed, 2);
    }
}
