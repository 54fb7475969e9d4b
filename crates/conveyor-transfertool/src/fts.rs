//! FTS3-style REST client.
//!
//! Two calls per job: `GET {base}/jobs/{id}` for the job record and
//! `GET {base}/jobs/{id}/files` for per-file state, URLs and timestamps.
//! Reconciliation works per request, so jobs carry one file and only the
//! first file entry is used.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use conveyor_reconcile::normalizer::STATE_NOT_FOUND;

use crate::{RawTransferResponse, TransferTool, TransferToolError};

#[derive(Debug, Clone)]
pub struct FtsRestClient {
    http: reqwest::Client,
    base_url: String,
}

impl FtsRestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::new_with_client(base_url, reqwest::Client::new())
    }

    /// Use a preconfigured client (timeouts, client certificates).
    pub fn new_with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn job_url(&self, job_id: &str) -> String {
        format!("{}/jobs/{}", self.base_url.trim_end_matches('/'), job_id)
    }

    /// `Ok(None)` on HTTP 404.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, TransferToolError> {
        let resp = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| TransferToolError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(TransferToolError::Api {
                status: status.as_u16(),
                message,
            });
        }

        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| TransferToolError::Decode(format!("{url}: {e}")))
    }
}

#[async_trait::async_trait]
impl TransferTool for FtsRestClient {
    fn name(&self) -> &'static str {
        "fts3"
    }

    async fn query(&self, external_id: &str) -> Result<RawTransferResponse, TransferToolError> {
        let url = self.job_url(external_id);
        let Some(job) = self.get_json::<FtsJob>(&url).await? else {
            debug!(job_id = external_id, "transfer job unknown to the tool");
            return Ok(RawTransferResponse {
                job_id: external_id.to_string(),
                job_state: Some(STATE_NOT_FOUND.to_string()),
                ..Default::default()
            });
        };

        let files: Vec<FtsFile> = self
            .get_json(&format!("{url}/files"))
            .await?
            .unwrap_or_default();
        if files.len() > 1 {
            debug!(
                job_id = external_id,
                files = files.len(),
                "multi-file job, using first file"
            );
        }

        Ok(merge(external_id, job, files.into_iter().next()))
    }
}

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
struct FtsJob {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    job_state: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    job_finished: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FtsFile {
    #[serde(default)]
    file_state: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    source_surl: Option<String>,
    #[serde(default)]
    dest_surl: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    finish_time: Option<String>,
}

/// File fields win over job fields where both exist.
fn merge(external_id: &str, job: FtsJob, file: Option<FtsFile>) -> RawTransferResponse {
    let file = file.unwrap_or_default();
    RawTransferResponse {
        job_id: job.job_id.unwrap_or_else(|| external_id.to_string()),
        job_state: job.job_state,
        file_state: file.file_state,
        reason: file.reason.or(job.reason),
        source_surl: file.source_surl,
        dest_surl: file.dest_surl,
        start_time: file.start_time,
        finish_time: file.finish_time.or(job.job_finished),
    }
}
