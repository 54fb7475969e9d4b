//! Transfer Outcome Normalizer: map a raw transfer-tool report to an [`Outcome`].
//!
//! # Purpose
//! The transfer tool reports job/file status in its own JSON schema. This
//! module defines the wire-level [`RawTransferResponse`] and a single
//! [`normalize`] function that validates it and converts it into the typed
//! [`Outcome`] consumed by the reconciliation engine.
//!
//! # Design constraints
//! - Pure, deterministic conversion. No IO, no catalog calls, no async.
//! - `Ok(None)` means "nothing to report yet" (transfer still in flight).
//!   It is not an error and the caller must skip reconciliation.
//! - Required fields are validated here, not at point of use.

use chrono::{DateTime, NaiveDateTime};
use conveyor_schemas::{RequestDetails, RequestState};
use serde::{Deserialize, Serialize};

use crate::Outcome;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("transfer response has empty job_id")]
    MissingTransferId,
    #[error("transfer job '{job_id}' has no job_state or file_state")]
    MissingState { job_id: String },
    #[error("transfer job '{job_id}' has unrecognised state '{raw}'")]
    UnknownState { job_id: String, raw: String },
    #[error("transfer job '{job_id}' has unparsable {field} '{raw}'")]
    InvalidTimestamp {
        job_id: String,
        field: &'static str,
        raw: String,
    },
}

// ---------------------------------------------------------------------------
// Raw wire-level struct
// ---------------------------------------------------------------------------

/// Wire-level status of one transfer as reported by the transfer tool.
///
/// Unknown fields are ignored. Empty strings are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransferResponse {
    pub job_id: String,
    #[serde(default)]
    pub job_state: Option<String>,
    /// Per-file state; preferred over `job_state` when present.
    #[serde(default)]
    pub file_state: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub source_surl: Option<String>,
    #[serde(default)]
    pub dest_surl: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub finish_time: Option<String>,
}

/// State reported for a job the transfer tool no longer knows about.
pub const STATE_NOT_FOUND: &str = "NOT_FOUND";

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `Ok(None)` for states that carry no transition yet.
fn normalize_state(job_id: &str, raw: &str) -> Result<Option<RequestState>, NormalizeError> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "FINISHED" => Ok(Some(RequestState::Done)),
        "FAILED" | "CANCELED" | "CANCELLED" => Ok(Some(RequestState::Failed)),
        "NOT_FOUND" | "LOST" => Ok(Some(RequestState::Lost)),
        "SUBMITTED" | "READY" | "ACTIVE" | "STAGING" | "STARTED" | "QUEUED" | "DELETE" => Ok(None),
        _ => Err(NormalizeError::UnknownState {
            job_id: job_id.to_string(),
            raw: raw.to_string(),
        }),
    }
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Parse a transfer-tool timestamp (UTC, no offset) or an RFC 3339 string.
pub fn parse_transfer_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.naive_utc())
        })
}

fn normalize_timestamp(
    job_id: &str,
    field: &'static str,
    raw: &Option<String>,
) -> Result<Option<NaiveDateTime>, NormalizeError> {
    match non_empty(raw) {
        None => Ok(None),
        Some(s) => parse_transfer_timestamp(&s).map(Some).ok_or_else(|| {
            NormalizeError::InvalidTimestamp {
                job_id: job_id.to_string(),
                field,
                raw: s,
            }
        }),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Normalize a raw transfer-tool response.
///
/// # Errors
/// Returns the first [`NormalizeError`] encountered. Timestamps are validated
/// even for in-flight reports.
pub fn normalize(raw: &RawTransferResponse) -> Result<Option<Outcome>, NormalizeError> {
    let job_id = raw.job_id.trim();
    if job_id.is_empty() {
        return Err(NormalizeError::MissingTransferId);
    }

    let state_raw = non_empty(&raw.file_state)
        .or_else(|| non_empty(&raw.job_state))
        .ok_or_else(|| NormalizeError::MissingState {
            job_id: job_id.to_string(),
        })?;

    let start_time = normalize_timestamp(job_id, "start_time", &raw.start_time)?;
    let finish_time = normalize_timestamp(job_id, "finish_time", &raw.finish_time)?;

    let Some(new_state) = normalize_state(job_id, &state_raw)? else {
        return Ok(None);
    };

    Ok(Some(Outcome {
        new_state,
        transfer_id: job_id.to_string(),
        details: RequestDetails {
            source_surl: non_empty(&raw.source_surl),
            dest_surl: non_empty(&raw.dest_surl),
            start_time,
            finish_time,
            reason: non_empty(&raw.reason),
        },
    }))
}

/// Deserialize a JSON string and normalize it.
///
/// Convenience wrapper: `json_str → RawTransferResponse → Option<Outcome>`.
pub fn normalize_json(json: &str) -> Result<Option<Outcome>, Box<dyn std::error::Error>> {
    let raw: RawTransferResponse = serde_json::from_str(json)?;
    Ok(normalize(&raw)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
