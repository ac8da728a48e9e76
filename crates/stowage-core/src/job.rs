//! Jobs: the typed units of work a client submits to the server.
//!
//! On the wire a job is a JSON object tagged by `kind`:
//!
//! ```json
//! {"kind": "GetTree", "uuid": "…", "client_name": "laptop",
//!  "target_name": "nas", "auth": {"message": "…", "hex_signature": "…"}}
//! ```
//!
//! A `Batch` carries no proof of its own; every member carries one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::encoding::base64_bytes;
use crate::identity::AuthProof;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterClient {
    pub uuid: Uuid,
    pub client_name: String,
    /// PEM public key being registered. The proof must verify against it.
    pub public_key: String,
    pub auth: AuthProof,
    /// Endorsement by the previously registered key when replacing it: a
    /// signature over the SHA-256 hex of `public_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal: Option<AuthProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinClient {
    pub uuid: Uuid,
    pub client_name: String,
    pub target_names: BTreeSet<String>,
    pub auth: AuthProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTree {
    pub uuid: Uuid,
    pub client_name: String,
    pub target_name: String,
    pub auth: AuthProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFile {
    pub uuid: Uuid,
    pub client_name: String,
    pub target_name: String,
    pub path_fingerprint: String,
    /// Client-side freshness token, recorded by the target on write.
    pub token: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub auth: AuthProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub uuid: Uuid,
    pub jobs: Vec<Job>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            jobs: Vec::new(),
        }
    }

    /// Append a job. No deduplication.
    pub fn add(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Job {
    RegisterClient(RegisterClient),
    CheckinClient(CheckinClient),
    GetTree(GetTree),
    SendFile(SendFile),
    Batch(Batch),
}

impl Job {
    pub fn register_client(
        client_name: impl Into<String>,
        public_key: impl Into<String>,
        auth: AuthProof,
    ) -> Self {
        Job::RegisterClient(RegisterClient {
            uuid: Uuid::new_v4(),
            client_name: client_name.into(),
            public_key: public_key.into(),
            auth,
            renewal: None,
        })
    }

    pub fn checkin_client(
        client_name: impl Into<String>,
        target_names: impl IntoIterator<Item = String>,
        auth: AuthProof,
    ) -> Self {
        Job::CheckinClient(CheckinClient {
            uuid: Uuid::new_v4(),
            client_name: client_name.into(),
            target_names: target_names.into_iter().collect(),
            auth,
        })
    }

    pub fn get_tree(
        client_name: impl Into<String>,
        target_name: impl Into<String>,
        auth: AuthProof,
    ) -> Self {
        Job::GetTree(GetTree {
            uuid: Uuid::new_v4(),
            client_name: client_name.into(),
            target_name: target_name.into(),
            auth,
        })
    }

    pub fn send_file(
        client_name: impl Into<String>,
        target_name: impl Into<String>,
        path_fingerprint: impl Into<String>,
        token: impl Into<String>,
        content: Vec<u8>,
        auth: AuthProof,
    ) -> Self {
        Job::SendFile(SendFile {
            uuid: Uuid::new_v4(),
            client_name: client_name.into(),
            target_name: target_name.into(),
            path_fingerprint: path_fingerprint.into(),
            token: token.into(),
            content,
            auth,
        })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::RegisterClient(_) => JobKind::RegisterClient,
            Job::CheckinClient(_) => JobKind::CheckinClient,
            Job::GetTree(_) => JobKind::GetTree,
            Job::SendFile(_) => JobKind::SendFile,
            Job::Batch(_) => JobKind::Batch,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Job::RegisterClient(j) => j.uuid,
            Job::CheckinClient(j) => j.uuid,
            Job::GetTree(j) => j.uuid,
            Job::SendFile(j) => j.uuid,
            Job::Batch(j) => j.uuid,
        }
    }

    /// The proof carried by the job; `None` only for batches.
    pub fn auth(&self) -> Option<&AuthProof> {
        match self {
            Job::RegisterClient(j) => Some(&j.auth),
            Job::CheckinClient(j) => Some(&j.auth),
            Job::GetTree(j) => Some(&j.auth),
            Job::SendFile(j) => Some(&j.auth),
            Job::Batch(_) => None,
        }
    }

    pub fn client_name(&self) -> Option<&str> {
        match self {
            Job::RegisterClient(j) => Some(&j.client_name),
            Job::CheckinClient(j) => Some(&j.client_name),
            Job::GetTree(j) => Some(&j.client_name),
            Job::SendFile(j) => Some(&j.client_name),
            Job::Batch(_) => None,
        }
    }

    /// Decode one job from its wire form.
    ///
    /// The `kind` tag is checked first, then every required field; only a
    /// structurally complete job is handed on for authentication.
    pub fn decode(value: Value) -> Result<Job, JobError> {
        let kind = kind_of(&value)?;
        if kind == JobKind::Batch {
            let uuid = Uuid::parse_str(&uuid_hint(&value))
                .map_err(|e| JobError::Malformed(format!("`uuid`: {e}")))?;
            let jobs = decode_batch(value)?
                .into_iter()
                .map(|d| d.job)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Job::Batch(Batch { uuid, jobs }));
        }
        decode_single(kind, value)
    }

    fn validate(&self) -> Result<(), JobError> {
        let non_empty = |field: &'static str, value: &str| {
            if value.trim().is_empty() {
                Err(JobError::Malformed(format!("`{field}` must not be empty")))
            } else {
                Ok(())
            }
        };

        match self {
            Job::RegisterClient(j) => {
                non_empty("client_name", &j.client_name)?;
                non_empty("public_key", &j.public_key)
            }
            Job::CheckinClient(j) => non_empty("client_name", &j.client_name),
            Job::GetTree(j) => {
                non_empty("client_name", &j.client_name)?;
                non_empty("target_name", &j.target_name)
            }
            Job::SendFile(j) => {
                non_empty("client_name", &j.client_name)?;
                non_empty("target_name", &j.target_name)?;
                non_empty("path_fingerprint", &j.path_fingerprint)
            }
            Job::Batch(_) => Ok(()),
        }
    }
}

/// The closed set of job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    RegisterClient,
    CheckinClient,
    GetTree,
    SendFile,
    Batch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RegisterClient => "RegisterClient",
            JobKind::CheckinClient => "CheckinClient",
            JobKind::GetTree => "GetTree",
            JobKind::SendFile => "SendFile",
            JobKind::Batch => "Batch",
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            JobKind::RegisterClient => &["uuid", "client_name", "public_key", "auth"],
            JobKind::CheckinClient => &["uuid", "client_name", "target_names", "auth"],
            JobKind::GetTree => &["uuid", "client_name", "target_name", "auth"],
            JobKind::SendFile => &[
                "uuid",
                "client_name",
                "target_name",
                "path_fingerprint",
                "token",
                "content",
                "auth",
            ],
            JobKind::Batch => &["uuid", "jobs"],
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RegisterClient" => Ok(JobKind::RegisterClient),
            "CheckinClient" => Ok(JobKind::CheckinClient),
            "GetTree" => Ok(JobKind::GetTree),
            "SendFile" => Ok(JobKind::SendFile),
            "Batch" => Ok(JobKind::Batch),
            other => Err(JobError::UnknownJobKind(other.to_string())),
        }
    }
}

/// A job decoded from the wire, remembering the uuid it claimed even when
/// decoding failed so the failure can still be correlated.
#[derive(Debug)]
pub struct Decoded {
    pub uuid: String,
    pub job: Result<Job, JobError>,
}

/// A top-level submission: one job, or a batch decoded member by member.
#[derive(Debug)]
pub enum Request {
    Single(Decoded),
    Batch(Vec<Decoded>),
}

impl Request {
    pub fn decode(value: Value) -> Request {
        let uuid = uuid_hint(&value);
        match kind_of(&value) {
            Ok(JobKind::Batch) => match decode_batch(value) {
                Ok(members) => Request::Batch(members),
                Err(e) => Request::Single(Decoded { uuid, job: Err(e) }),
            },
            Ok(kind) => Request::Single(Decoded {
                uuid,
                job: decode_single(kind, value),
            }),
            Err(e) => Request::Single(Decoded { uuid, job: Err(e) }),
        }
    }
}

fn kind_of(value: &Value) -> Result<JobKind, JobError> {
    let object = value
        .as_object()
        .ok_or_else(|| JobError::Malformed("job must be a JSON object".into()))?;
    let kind = object.get("kind").ok_or(JobError::MissingField("kind"))?;
    kind.as_str()
        .ok_or_else(|| JobError::Malformed("`kind` must be a string".into()))?
        .parse()
}

fn check_fields(kind: JobKind, value: &Value) -> Result<(), JobError> {
    for field in kind.required_fields() {
        if value.get(*field).is_none_or(Value::is_null) {
            return Err(JobError::MissingField(field));
        }
    }
    Ok(())
}

fn decode_single(kind: JobKind, value: Value) -> Result<Job, JobError> {
    check_fields(kind, &value)?;
    let job: Job =
        serde_json::from_value(value).map_err(|e| JobError::Malformed(e.to_string()))?;
    job.validate()?;
    Ok(job)
}

fn decode_batch(mut value: Value) -> Result<Vec<Decoded>, JobError> {
    check_fields(JobKind::Batch, &value)?;
    let Some(Value::Array(members)) = value.get_mut("jobs").map(Value::take) else {
        return Err(JobError::Malformed("`jobs` must be an array".into()));
    };

    Ok(members
        .into_iter()
        .map(|member| {
            let uuid = uuid_hint(&member);
            let job = match kind_of(&member) {
                Ok(JobKind::Batch) => Err(JobError::NestedBatch),
                Ok(kind) => decode_single(kind, member),
                Err(e) => Err(e),
            };
            Decoded { uuid, job }
        })
        .collect())
}

fn uuid_hint(value: &Value) -> String {
    value
        .get("uuid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// A job rejected before authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("malformed job: {0}")]
    Malformed(String),
    #[error("a batch cannot contain another batch")]
    NestedBatch,
}
