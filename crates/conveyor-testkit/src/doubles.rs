//! Recording doubles for the emitter, metrics and log ports.
//!
//! All doubles are `Clone` and share their buffer, so a test keeps one handle
//! and moves the other into the engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_reconcile::{
    EmitError, MetricsRecorder, Notification, NotificationEmitter, NotificationKind, ReconcileLog,
    Severity,
};
use conveyor_schemas::RequestId;

use crate::catalog::MemTx;

// ---------------------------------------------------------------------------
// Emitters
// ---------------------------------------------------------------------------

/// Non-transactional emitter: a notification is recorded the moment it is
/// emitted, even if the caller later rolls back (external broker semantics).
#[derive(Clone, Default)]
pub struct RecordingEmitter {
    sent: Arc<Mutex<Vec<Notification>>>,
    fail_with: Arc<Mutex<Option<EmitError>>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }

    pub fn fail_with(&self, err: Option<EmitError>) {
        *self.fail_with.lock().unwrap() = err;
    }
}

#[async_trait]
impl<Tx: Send> NotificationEmitter<Tx> for RecordingEmitter {
    async fn emit(&self, _tx: &mut Tx, notification: &Notification) -> Result<(), EmitError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Transactional emitter: writes into the staged catalog's outbox, so the
/// message exists only if the transaction commits.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemOutbox;

#[async_trait]
impl NotificationEmitter<MemTx> for MemOutbox {
    async fn emit(&self, tx: &mut MemTx, notification: &Notification) -> Result<(), EmitError> {
        tx.staged.messages.push(notification.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingMetrics {
    timers: Arc<Mutex<Vec<(String, Duration)>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl MetricsRecorder for RecordingMetrics {
    fn record_timer(&self, metric: &str, elapsed: Duration) {
        self.timers
            .lock()
            .unwrap()
            .push((metric.to_string(), elapsed));
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub severity: Severity,
    pub request_id: RequestId,
    pub message: String,
}

#[derive(Clone, Default)]
pub struct RecordingLog {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl RecordingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().unwrap().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.severity == severity)
            .count()
    }

    /// `true` if some line at `severity` contains `needle`.
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.severity == severity && l.message.contains(needle))
    }
}

impl ReconcileLog for RecordingLog {
    fn log(&self, severity: Severity, request_id: RequestId, message: &str) {
        self.lines.lock().unwrap().push(LogLine {
            severity,
            request_id,
            message: message.to_string(),
        });
    }
}
