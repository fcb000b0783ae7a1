// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Overage reporting to the billing system.
//!
//! Reports are fire-and-forget: the allowance gate spawns them and only logs
//! failures. A lost report under-bills, it never blocks inference.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::storage::InferenceKind;

/// Timeout for a single overage report.
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// One unit consumed past the plan limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverageEvent {
    pub user_id: String,
    pub plan: String,
    pub kind: InferenceKind,
    pub units: u32,
    pub usage_record_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("overage report failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("billing endpoint returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait OverageReporter: Send + Sync {
    async fn report(&self, event: &OverageEvent) -> Result<(), BillingError>;
}

/// POSTs overage events as JSON to a billing webhook.
pub struct HttpOverageReporter {
    client: reqwest::Client,
    url: String,
}

impl HttpOverageReporter {
    pub fn new(url: impl Into<String>) -> Result<Self, BillingError> {
        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl OverageReporter for HttpOverageReporter {
    async fn report(&self, event: &OverageEvent) -> Result<(), BillingError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Used when no billing webhook is configured.
pub struct LoggingOverageReporter;

#[async_trait]
impl OverageReporter for LoggingOverageReporter {
    async fn report(&self, event: &OverageEvent) -> Result<(), BillingError> {
        info!(
            user_id = %event.user_id,
            plan = %event.plan,
            kind = %event.kind,
            units = event.units,
            "Overage recorded (no billing endpoint configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> OverageEvent {
        OverageEvent {
            user_id: "u1".into(),
            plan: "pro".into(),
            kind: InferenceKind::PrivateEnclave,
            units: 1,
            usage_record_id: "rec-1".into(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn http_reporter_posts_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/overage"))
            .and(body_partial_json(serde_json::json!({
                "userId": "u1",
                "kind": "private_enclave",
                "units": 1
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = HttpOverageReporter::new(format!("{}/overage", server.uri())).unwrap();
        reporter.report(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn http_reporter_surfaces_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reporter = HttpOverageReporter::new(server.uri()).unwrap();
        let err = reporter.report(&event()).await.unwrap_err();
        assert!(matches!(err, BillingError::Status(500)));
    }
}
