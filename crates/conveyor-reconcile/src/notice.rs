//! Notification messages emitted after a terminal outcome.
//!
//! Payload keys are the wire names downstream consumers subscribe to
//! (`request-id`, `file-size`, `dst-url`, ...). Values are restricted to
//! [`Scalar`].

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use conveyor_schemas::{DidMeta, Request, RequestDetails, Scalar};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "transfer-done")]
    TransferDone,
    #[serde(rename = "transfer-failed")]
    TransferFailed,
    #[serde(rename = "transfer-lost")]
    TransferLost,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TransferDone => "transfer-done",
            NotificationKind::TransferFailed => "transfer-failed",
            NotificationKind::TransferLost => "transfer-lost",
        }
    }
}

/// One structured event for downstream consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub payload: BTreeMap<String, Scalar>,
}

impl Notification {
    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.payload.get(key)
    }

    /// Payload as a JSON object (for outbox storage).
    pub fn payload_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .payload
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone())))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Deployment-wide values stamped on every notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoticeSettings {
    /// Activity tag used when the request carries none.
    pub activity: String,
    /// Identifies this reconciler to consumers (`tool-id`).
    pub tool_id: String,
    /// Transfer-tool base URL (`transfer-endpoint`, also the base of `reason-link`).
    pub transfer_endpoint: String,
}

impl Default for NoticeSettings {
    fn default() -> Self {
        Self {
            activity: "default".to_string(),
            tool_id: "conveyor".to_string(),
            transfer_endpoint: String::new(),
        }
    }
}

/// Whole seconds between start and finish. `None` if either is unknown.
pub fn transfer_duration_secs(
    start: Option<NaiveDateTime>,
    finish: Option<NaiveDateTime>,
) -> Option<i64> {
    Some(finish?.signed_duration_since(start?).num_seconds())
}

/// URL scheme of a transfer URL (`"https://host/p"` -> `"https"`).
pub fn protocol_of(url: &str) -> Option<&str> {
    url.split_once(':').map(|(scheme, _)| scheme)
}

/// Monitoring link for a transfer-tool job.
pub fn reason_link(transfer_endpoint: &str, transfer_id: &str) -> String {
    format!(
        "{}/fts3/ftsmon/#/job/{}",
        transfer_endpoint.trim_end_matches('/'),
        transfer_id
    )
}

/// Everything a notification is assembled from.
pub(crate) struct NoticeContext<'a> {
    pub settings: &'a NoticeSettings,
    pub request: &'a Request,
    pub dst_rse: &'a str,
    pub src_rse: Option<&'a str>,
    pub meta: &'a DidMeta,
    pub details: &'a RequestDetails,
    pub transfer_id: &'a str,
}

impl NoticeContext<'_> {
    fn common(&self) -> BTreeMap<String, Scalar> {
        let activity = self
            .request
            .activity
            .clone()
            .unwrap_or_else(|| self.settings.activity.clone());
        let dest_surl = self.details.dest_surl.as_deref();

        let mut p: BTreeMap<String, Scalar> = BTreeMap::new();
        p.insert("activity".into(), activity.into());
        p.insert(
            "request-id".into(),
            self.request.request_id.to_string().into(),
        );
        p.insert("file-size".into(), self.meta.bytes.into());
        p.insert("guid".into(), self.meta.guid.clone().into());
        p.insert(
            "previous-request-id".into(),
            self.request.previous_attempt_id.map(|id| id.to_string()).into(),
        );
        p.insert("protocol".into(), dest_surl.and_then(protocol_of).into());
        p.insert("scope".into(), self.request.scope.as_str().into());
        p.insert("name".into(), self.request.name.as_str().into());
        p.insert("src-rse".into(), self.src_rse.into());
        p.insert("src-url".into(), self.details.source_surl.clone().into());
        p.insert("dst-rse".into(), self.dst_rse.into());
        p.insert("dst-url".into(), dest_surl.into());
        p.insert(
            "transfer-endpoint".into(),
            self.settings.transfer_endpoint.as_str().into(),
        );
        p.insert("transfer-id".into(), self.transfer_id.into());
        p.insert("tool-id".into(), self.settings.tool_id.as_str().into());
        p
    }

    pub fn done(&self) -> Notification {
        let mut payload = self.common();
        let duration =
            transfer_duration_secs(self.details.start_time, self.details.finish_time);
        payload.insert("duration".into(), duration.into());
        Notification {
            kind: NotificationKind::TransferDone,
            payload,
        }
    }

    /// transfer-failed / transfer-lost: reason and checksums instead of duration.
    pub fn failure(&self, kind: NotificationKind) -> Notification {
        let mut payload = self.common();
        payload.insert("reason".into(), self.details.reason.clone().into());
        payload.insert(
            "reason-link".into(),
            reason_link(&self.settings.transfer_endpoint, self.transfer_id).into(),
        );
        payload.insert("checksum-adler".into(), self.meta.adler32.clone().into());
        payload.insert("checksum-md5".into(), self.meta.md5.clone().into());
        Notification { kind, payload }
    }
}
