use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized usage aggregates for one agent over an optional date range.
/// Produced fresh on every sync; the caller turns it into one ledger row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    /// Total minutes of call time. Never negative; no rounding applied here.
    pub minutes_used: f64,
    /// Number of calls covered by the snapshot.
    pub call_count: u64,
    /// Total provider-reported cost for the range.
    pub costs: f64,
    /// Range start echoed back by the provider (or the requested one).
    pub start_date: Option<DateTime<Utc>>,
    /// Range end echoed back by the provider (or the requested one).
    pub end_date: Option<DateTime<Utc>>,
}

/// A single call as reported by the upstream provider, after field-name
/// normalization. Optional fields reflect genuinely absent upstream data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    pub id: String,
    pub status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in minutes, when the provider reports one directly.
    pub duration: Option<f64>,
    pub cost: Option<f64>,
}

/// Contract for anything that can turn a plaintext provider credential into
/// usage metrics (the HTTP client in production, stubs in tests).
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Short provider name used for logging.
    fn name(&self) -> &'static str;

    /// Check whether the secret authenticates against the provider.
    /// Transport failures count as a failed check; this never errors.
    async fn verify_credential(&self, secret: &str) -> bool;

    /// Fetch aggregates for the given inclusive date range. A missing bound
    /// means unbounded on that side.
    async fn fetch_metrics(
        &self,
        secret: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> anyhow::Result<MetricsSnapshot>;

    /// List the most recent calls, newest-first as the provider returns them,
    /// truncated to `limit`.
    async fn fetch_recent_calls(&self, secret: &str, limit: usize)
        -> anyhow::Result<Vec<CallRecord>>;
}
