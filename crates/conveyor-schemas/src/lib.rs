//! conveyor-schemas
//!
//! Shared record types for transfer-request reconciliation: requests, their
//! states, replica states, per-request transfer details, data-identifier
//! metadata and the scalar values allowed in notification payloads.
//!
//! Plain data only. No IO.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque request identifier, assigned at submission and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// Storage endpoint (RSE) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RseId(pub Uuid);

impl RseId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} state: {raw}")]
pub struct InvalidState {
    pub kind: &'static str,
    pub raw: String,
}

/// Lifecycle state of a transfer request.
///
/// DONE, FAILED and LOST are terminal for a request instance. A retried
/// transfer continues as a new request linked by `previous_attempt_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Queued,
    Submitted,
    Done,
    Failed,
    Lost,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Queued => "QUEUED",
            RequestState::Submitted => "SUBMITTED",
            RequestState::Done => "DONE",
            RequestState::Failed => "FAILED",
            RequestState::Lost => "LOST",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidState> {
        match s {
            "QUEUED" => Ok(RequestState::Queued),
            "SUBMITTED" => Ok(RequestState::Submitted),
            "DONE" => Ok(RequestState::Done),
            "FAILED" => Ok(RequestState::Failed),
            "LOST" => Ok(RequestState::Lost),
            other => Err(InvalidState {
                kind: "request",
                raw: other.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Done | RequestState::Failed | RequestState::Lost
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability of a replica at a storage endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    Available,
    Unavailable,
    Copying,
    BeingDeleted,
    Bad,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Available => "AVAILABLE",
            ReplicaState::Unavailable => "UNAVAILABLE",
            ReplicaState::Copying => "COPYING",
            ReplicaState::BeingDeleted => "BEING_DELETED",
            ReplicaState::Bad => "BAD",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidState> {
        match s {
            "AVAILABLE" => Ok(ReplicaState::Available),
            "UNAVAILABLE" => Ok(ReplicaState::Unavailable),
            "COPYING" => Ok(ReplicaState::Copying),
            "BEING_DELETED" => Ok(ReplicaState::BeingDeleted),
            "BAD" => Ok(ReplicaState::Bad),
            other => Err(InvalidState {
                kind: "replica",
                raw: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a replication lock held by a rule on one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Replicating,
    Ok,
    Stuck,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Replicating => "REPLICATING",
            LockState::Ok => "OK",
            LockState::Stuck => "STUCK",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidState> {
        match s {
            "REPLICATING" => Ok(LockState::Replicating),
            "OK" => Ok(LockState::Ok),
            "STUCK" => Ok(LockState::Stuck),
            other => Err(InvalidState {
                kind: "lock",
                raw: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A live transfer request: "move (scope, name) to `dest_rse_id`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub scope: String,
    pub name: String,
    pub dest_rse_id: RseId,
    pub source_rse_id: Option<RseId>,
    pub retry_count: u32,
    pub previous_attempt_id: Option<RequestId>,
    pub state: RequestState,
    /// Transfer-tool job identifier, set once the request has been submitted.
    pub external_id: Option<String>,
    pub activity: Option<String>,
}

impl Request {
    /// Human-readable `scope:name` of the data identifier.
    pub fn did(&self) -> String {
        format!("{}:{}", self.scope, self.name)
    }
}

/// Per-transfer details recorded by the catalog (one row per request).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetails {
    pub source_surl: Option<String>,
    pub dest_surl: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub finish_time: Option<NaiveDateTime>,
    pub reason: Option<String>,
}

impl RequestDetails {
    /// Fill every absent field of `self` from `fallback`.
    pub fn or(self, fallback: RequestDetails) -> RequestDetails {
        RequestDetails {
            source_surl: self.source_surl.or(fallback.source_surl),
            dest_surl: self.dest_surl.or(fallback.dest_surl),
            start_time: self.start_time.or(fallback.start_time),
            finish_time: self.finish_time.or(fallback.finish_time),
            reason: self.reason.or(fallback.reason),
        }
    }
}

/// Descriptive metadata of a data identifier. Read-only for reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidMeta {
    pub bytes: Option<i64>,
    pub guid: Option<String>,
    pub adler32: Option<String>,
    pub md5: Option<String>,
}

// ---------------------------------------------------------------------------
// Scalar payload values
// ---------------------------------------------------------------------------

/// The value types allowed in a notification payload: int, float and
/// string, plus `Null` for a value the reconciliation could not determine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Scalar::Null)
    }
}

impl From<Scalar> for serde_json::Value {
    fn from(v: Scalar) -> Self {
        match v {
            Scalar::Int(i) => serde_json::Value::from(i),
            Scalar::Float(f) => serde_json::Value::from(f),
            Scalar::Str(s) => serde_json::Value::String(s),
            Scalar::Null => serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
