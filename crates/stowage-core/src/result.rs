//! Server responses to submitted jobs.

use serde::{Deserialize, Serialize};

use crate::fingerprint::FingerprintMap;

/// Why a job did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed job or unknown kind. Never worth retrying as-is.
    Structural,
    /// Proof did not verify, or the client is unknown. Retry with a new proof.
    Authentication,
    /// Target not currently live. Retry after the next checkin.
    UnavailableTarget,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::UnavailableTarget)
    }
}

/// Result of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    pub job_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_targets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_targets: Option<Vec<String>>,
    /// The tree the target last reported for this client, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<FingerprintMap>,
}

impl JobResult {
    pub fn ok(job_uuid: impl Into<String>) -> Self {
        Self {
            success: true,
            msg: None,
            job_uuid: job_uuid.into(),
            error: None,
            online_targets: None,
            offline_targets: None,
            tree: None,
        }
    }

    pub fn failed(job_uuid: impl Into<String>, error: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: Some(msg.into()),
            error: Some(error),
            ..Self::ok(job_uuid)
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }
}

/// Response body: one result, or one per batch member in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Batch(Vec<JobResult>),
    Single(JobResult),
}

impl Response {
    /// Flatten into a list of results.
    pub fn into_results(self) -> Vec<JobResult> {
        match self {
            Response::Batch(results) => results,
            Response::Single(result) => vec![result],
        }
    }
}
