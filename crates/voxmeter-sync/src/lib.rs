//! HTTP client for the external voice-metrics provider.
//!
//! The upstream API has moved its analytics feature between paths over time,
//! so every logical operation is an ordered list of candidate requests tried
//! sequentially until one succeeds. When no analytics shape works at all, a
//! snapshot is aggregated client-side from the raw call listing.

mod normalize;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, instrument};
use voxmeter_core::metrics::{CallRecord, MetricsSnapshot, MetricsSource};

/// Production API base; override with [`MetricsClient::with_base_url`] for
/// staging or tests.
pub const DEFAULT_BASE_URL: &str = "https://api.vapi.ai";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Known homes of the analytics endpoint, newest guess first.
const ANALYTICS_PATHS: [&str; 4] = [
    "/analytics",
    "/v1/analytics",
    "/analytics/get",
    "/v1/analytics/get",
];

const METRIC_COLUMNS: [&str; 3] = ["minutesUsed", "callCount", "costs"];

/// Errors produced by the sync client.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network-level failure reaching the provider (includes timeouts).
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The provider answered with a non-success status.
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    /// Every analytics candidate and the call-listing fallback failed.
    /// Carries the most recent underlying error for diagnostics.
    #[error("metrics fetch exhausted all endpoints")]
    MetricsFetch {
        #[source]
        source: Box<SyncError>,
    },
}

/// Client for the provider's metrics API. Cheap to clone; holds only a
/// connection pool and the base URL.
#[derive(Clone)]
pub struct MetricsClient {
    base_url: String,
    client: reqwest::Client,
}

impl MetricsClient {
    pub fn new() -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
        })
    }

    /// Point the client at a different API base (staging, wiremock).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    /// Fetch normalized usage aggregates for an inclusive date range.
    ///
    /// Tries each analytics candidate once, in order; on total miss,
    /// aggregates from the raw call listing. No retry or backoff here — one
    /// pass per invocation, retry policy belongs to the caller.
    #[instrument(skip(self, secret))]
    pub async fn fetch_metrics(
        &self,
        secret: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<MetricsSnapshot, SyncError> {
        let body = analytics_body(&METRIC_COLUMNS, start, end);
        let mut last_error: Option<SyncError> = None;

        for path in ANALYTICS_PATHS {
            let url = self.url(path);
            let sent = self
                .client
                .post(&url)
                .bearer_auth(secret)
                .json(&body)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    debug!(%url, error = %err, "analytics candidate unreachable");
                    last_error = Some(SyncError::Transport(err));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                match response.json::<Value>().await {
                    Ok(parsed) => {
                        debug!(%url, "analytics endpoint answered");
                        return Ok(normalize::snapshot_from_analytics(&parsed, start, end));
                    }
                    Err(err) => {
                        debug!(%url, error = %err, "analytics body unreadable");
                        last_error = Some(SyncError::Transport(err));
                        continue;
                    }
                }
            }

            // 404 just means "not this path". Anything else suggests the
            // endpoint exists but disliked the request shape, so it becomes
            // the error of record if the fallback cannot save us either.
            if status != StatusCode::NOT_FOUND {
                let text = response.text().await.unwrap_or_default();
                debug!(%url, %status, "analytics candidate rejected the request");
                last_error = Some(SyncError::Status { status, body: text });
            }
        }

        debug!("no analytics endpoint answered; aggregating from call listing");
        match self.list_calls_raw(secret).await {
            Ok(calls) => Ok(normalize::snapshot_from_calls(&calls, start, end)),
            // A transport failure on the fallback is the freshest signal;
            // an HTTP rejection defers to whatever the analytics search saw.
            Err(err @ SyncError::Transport(_)) => Err(SyncError::MetricsFetch {
                source: Box::new(err),
            }),
            Err(err) => Err(SyncError::MetricsFetch {
                source: Box::new(last_error.unwrap_or(err)),
            }),
        }
    }

    /// Check whether a secret authenticates at all. Probes lightweight
    /// read-only endpoints in order and accepts the first response that is
    /// not an authorization failure; the probe's own business outcome is
    /// irrelevant. Transport errors just advance to the next probe.
    #[instrument(skip_all)]
    pub async fn verify_credential(&self, secret: &str) -> bool {
        let probes = [
            self.client.get(self.url("/call")),
            self.client.get(self.url("/phone-number")),
            self.client
                .post(self.url("/analytics"))
                .json(&json!({ "columns": ["callCount"] })),
        ];

        for probe in probes {
            match probe.bearer_auth(secret).send().await {
                Ok(response)
                    if response.status() != StatusCode::UNAUTHORIZED
                        && response.status() != StatusCode::FORBIDDEN =>
                {
                    debug!(status = %response.status(), "credential accepted");
                    return true;
                }
                Ok(response) => {
                    debug!(status = %response.status(), "credential rejected, trying next probe");
                }
                Err(err) => {
                    debug!(error = %err, "verification probe unreachable");
                }
            }
        }
        false
    }

    /// List the provider's most recent calls, normalized, truncated to `limit`.
    #[instrument(skip(self, secret))]
    pub async fn fetch_recent_calls(
        &self,
        secret: &str,
        limit: usize,
    ) -> Result<Vec<CallRecord>, SyncError> {
        let calls = self.list_calls_raw(secret).await?;
        Ok(calls
            .iter()
            .take(limit)
            .map(normalize::call_record)
            .collect())
    }

    async fn list_calls_raw(&self, secret: &str) -> Result<Vec<Value>, SyncError> {
        let response = self
            .client
            .get(self.url("/call"))
            .bearer_auth(secret)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: Value = response.json().await?;
        Ok(normalize::calls_array(body))
    }
}

fn analytics_body(
    columns: &[&str],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Value {
    let mut body = json!({ "columns": columns });
    if let Some(start) = start {
        body["startDate"] = json!(start.to_rfc3339());
    }
    if let Some(end) = end {
        body["endDate"] = json!(end.to_rfc3339());
    }
    body
}

#[async_trait]
impl MetricsSource for MetricsClient {
    fn name(&self) -> &'static str {
        "vapi"
    }

    async fn verify_credential(&self, secret: &str) -> bool {
        MetricsClient::verify_credential(self, secret).await
    }

    async fn fetch_metrics(
        &self,
        secret: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> anyhow::Result<MetricsSnapshot> {
        Ok(MetricsClient::fetch_metrics(self, secret, start, end).await?)
    }

    async fn fetch_recent_calls(
        &self,
        secret: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<CallRecord>> {
        Ok(MetricsClient::fetch_recent_calls(self, secret, limit).await?)
    }
}
