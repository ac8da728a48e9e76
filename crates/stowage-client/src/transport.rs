use std::future::Future;
use std::time::Duration;

use stowage_core::{Job, Response};

/// Carries one job (or batch) to the server and brings back its response.
///
/// An `Err` means the server never answered; the job must stay queued.
pub trait Transport: Send + Sync {
    fn submit(&self, job: &Job) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

/// `POST <server>/process_job` with the job as JSON.
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(server_address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/process_job", server_address.trim_end_matches('/')),
        })
    }
}

impl Transport for HttpTransport {
    async fn submit(&self, job: &Job) -> Result<Response, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(job)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("server unreachable: {0}")]
    Unreachable(String),
}
