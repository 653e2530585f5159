//! Defensive field-name normalization for the upstream metrics API.
//!
//! The provider has shipped the same logical fields under different casings
//! and nestings across versions. Each logical field gets an explicit ordered
//! accessor list, evaluated in priority order; unresolved fields default to 0.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;
use voxmeter_core::metrics::{CallRecord, MetricsSnapshot};

/// Accessor paths per field: camelCase, then snake_case, then nested under `data`.
const MINUTES_PATHS: &[&[&str]] = &[&["minutesUsed"], &["minutes_used"], &["data", "minutesUsed"]];
const CALL_COUNT_PATHS: &[&[&str]] = &[&["callCount"], &["call_count"], &["data", "callCount"]];
const COSTS_PATHS: &[&[&str]] = &[&["costs"], &["cost"], &["data", "costs"]];
const START_DATE_PATHS: &[&[&str]] = &[&["startDate"], &["start_date"]];
const END_DATE_PATHS: &[&[&str]] = &[&["endDate"], &["end_date"]];

/// Per-call accessors used by the listing fallback.
const CALL_TIMESTAMP_PATHS: &[&[&str]] = &[&["startedAt"], &["createdAt"], &["timestamp"]];
const CALL_ENDED_PATHS: &[&[&str]] = &[&["endedAt"], &["completedAt"]];
const CALL_COST_PATHS: &[&[&str]] = &[&["cost"], &["totalCost"], &["amount"]];
const CALL_DURATION_PATHS: &[&[&str]] = &[&["duration"], &["durationSeconds"]];
const CALL_ID_PATHS: &[&[&str]] = &[&["id"], &["callId"]];
const CALL_STATUS_PATHS: &[&[&str]] = &[&["status"], &["state"]];

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn number_at(value: &Value, paths: &[&[&str]]) -> Option<f64> {
    paths
        .iter()
        .find_map(|&path| lookup(value, path).and_then(Value::as_f64))
}

fn string_at(value: &Value, paths: &[&[&str]]) -> Option<String> {
    paths
        .iter()
        .find_map(|&path| lookup(value, path).and_then(Value::as_str))
        .map(str::to_owned)
}

/// Parse a timestamp value that may be an RFC 3339 string or epoch millis.
fn date_at(value: &Value, paths: &[&[&str]]) -> Option<DateTime<Utc>> {
    paths.iter().find_map(|&path| {
        let raw = lookup(value, path)?;
        if let Some(text) = raw.as_str() {
            return DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
        raw.as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    })
}

/// Build a snapshot from an analytics-endpoint response body.
/// Unresolved fields default to 0; a response where nothing matched is
/// flagged in the logs to aid debugging upstream shape drift.
pub(crate) fn snapshot_from_analytics(
    body: &Value,
    requested_start: Option<DateTime<Utc>>,
    requested_end: Option<DateTime<Utc>>,
) -> MetricsSnapshot {
    let minutes_used = number_at(body, MINUTES_PATHS);
    let call_count = number_at(body, CALL_COUNT_PATHS);
    let costs = number_at(body, COSTS_PATHS);

    if minutes_used.is_none() && call_count.is_none() && costs.is_none() {
        warn!("analytics response matched none of the expected shapes; defaulting all fields to 0");
    }

    MetricsSnapshot {
        minutes_used: minutes_used.unwrap_or(0.0).max(0.0),
        call_count: call_count.unwrap_or(0.0).max(0.0) as u64,
        costs: costs.unwrap_or(0.0).max(0.0),
        start_date: date_at(body, START_DATE_PATHS).or(requested_start),
        end_date: date_at(body, END_DATE_PATHS).or(requested_end),
    }
}

/// Extract the call array from a listing response, which is either a bare
/// array or wrapped as `{"calls": [...]}`.
pub(crate) fn calls_array(body: Value) -> Vec<Value> {
    match body {
        Value::Array(calls) => calls,
        Value::Object(mut map) => match map.remove("calls") {
            Some(Value::Array(calls)) => calls,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn call_in_range(
    call: &Value,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> bool {
    if start.is_none() && end.is_none() {
        return true;
    }
    // A bounded range can only admit calls with a usable timestamp.
    let Some(at) = date_at(call, CALL_TIMESTAMP_PATHS) else {
        return false;
    };
    start.is_none_or(|s| at >= s) && end.is_none_or(|e| at <= e)
}

/// Minutes attributed to one call: the reported `duration`, else the span
/// between start and end timestamps, else 0.
fn call_minutes(call: &Value) -> f64 {
    if let Some(duration) = number_at(call, &[&["duration"]]) {
        return duration.max(0.0);
    }
    let started = date_at(call, &[&["startedAt"]]);
    let ended = date_at(call, &[&["endedAt"]]);
    match (started, ended) {
        (Some(started), Some(ended)) => {
            ((ended - started).num_milliseconds() as f64 / 60_000.0).max(0.0)
        }
        _ => 0.0,
    }
}

/// Aggregate a snapshot from raw call records when no analytics endpoint
/// responded (the fallback strategy).
pub(crate) fn snapshot_from_calls(
    calls: &[Value],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> MetricsSnapshot {
    let filtered: Vec<&Value> = calls
        .iter()
        .filter(|call| call_in_range(call, start, end))
        .collect();

    let minutes_used: f64 = filtered.iter().map(|call| call_minutes(call)).sum();
    let costs: f64 = filtered
        .iter()
        .map(|call| number_at(call, CALL_COST_PATHS).unwrap_or(0.0).max(0.0))
        .sum();

    MetricsSnapshot {
        minutes_used,
        call_count: filtered.len() as u64,
        costs,
        start_date: start,
        end_date: end,
    }
}

/// Normalize one raw call into a [`CallRecord`].
pub(crate) fn call_record(call: &Value) -> CallRecord {
    CallRecord {
        id: string_at(call, CALL_ID_PATHS).unwrap_or_default(),
        status: string_at(call, CALL_STATUS_PATHS),
        started_at: date_at(call, CALL_TIMESTAMP_PATHS),
        ended_at: date_at(call, CALL_ENDED_PATHS),
        duration: number_at(call, CALL_DURATION_PATHS),
        cost: number_at(call, CALL_COST_PATHS),
    }
}
