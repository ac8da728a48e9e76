//! The target's side of the conversation with the server.

use std::future::Future;
use std::time::Duration;

use stowage_core::{TargetMessage, TargetReply, TargetTask};

use crate::config::TargetConfig;
use crate::store::{TargetError, TargetStore};

/// How a target reaches the server.
pub trait ServerLink: Send + Sync {
    fn send(
        &self,
        message: &TargetMessage,
    ) -> impl Future<Output = Result<TargetReply, LinkError>> + Send;
}

/// `POST <server>/target` with a JSON body.
pub struct HttpLink {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpLink {
    pub fn new(server_address: &str, timeout: Duration) -> Result<Self, LinkError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/target", server_address.trim_end_matches('/')),
        })
    }
}

impl ServerLink for HttpLink {
    async fn send(&self, message: &TargetMessage) -> Result<TargetReply, LinkError> {
        let reply = self
            .http
            .post(&self.endpoint)
            .json(message)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }
}

pub struct TargetAgent<L> {
    name: String,
    store: TargetStore,
    link: L,
    poll_interval: Duration,
}

impl<L: ServerLink> TargetAgent<L> {
    pub fn new(config: &TargetConfig, store: TargetStore, link: L) -> Self {
        Self {
            name: config.target_name.clone(),
            store,
            link,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn store(&self) -> &TargetStore {
        &self.store
    }

    pub async fn announce(&self) -> Result<(), LinkError> {
        let reply = self
            .link
            .send(&TargetMessage::Announce {
                target_name: self.name.clone(),
            })
            .await?;
        expect_ack(reply)?;
        tracing::info!(target_name = %self.name, "announced to server");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let reply = self
            .link
            .send(&TargetMessage::Disconnect {
                target_name: self.name.clone(),
            })
            .await?;
        expect_ack(reply)
    }

    /// Fetch and apply queued tasks. Returns how many were applied.
    pub async fn poll_once(&mut self) -> Result<usize, LinkError> {
        let reply = self
            .link
            .send(&TargetMessage::Poll {
                target_name: self.name.clone(),
            })
            .await?;
        let tasks = match reply {
            TargetReply::Tasks { tasks } => tasks,
            TargetReply::Ack => Vec::new(),
            TargetReply::Error { code, message } => {
                return Err(LinkError::Rejected { code, message });
            }
        };

        let mut applied = 0;
        for task in tasks {
            // The server already handed these tasks over; nothing to retry.
            match self.apply(task) {
                Ok(Some(report)) => match self.link.send(&report).await.and_then(expect_ack) {
                    Ok(()) => applied += 1,
                    Err(e) => tracing::warn!("Report failed: {}", e),
                },
                Ok(None) => applied += 1,
                Err(e) => tracing::warn!("Task failed: {}", e),
            }
        }
        Ok(applied)
    }

    /// Apply one task to the store, returning the message to send back.
    pub fn apply(&mut self, task: TargetTask) -> Result<Option<TargetMessage>, TargetError> {
        self.store.register_client(task.client_name())?;
        match task {
            TargetTask::StoreFile {
                client_name,
                path_fingerprint,
                token,
                content,
                ..
            } => {
                if token.is_empty() {
                    self.store
                        .update_file(&client_name, &path_fingerprint, &content)?;
                } else {
                    self.store.update_file_with_token(
                        &client_name,
                        &path_fingerprint,
                        &content,
                        &token,
                    )?;
                }
                Ok(None)
            }
            TargetTask::ReportTree {
                client_name,
                job_uuid,
            } => Ok(Some(TargetMessage::ReportTree {
                target_name: self.name.clone(),
                tree: self.store.tree(&client_name),
                client_name,
                job_uuid,
            })),
        }
    }

    /// Announce, poll until `shutdown` resolves, then disconnect.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), LinkError> {
        self.announce().await?;
        let mut ticker = tokio::time::interval(self.poll_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!("Poll failed: {}", e);
                    }
                }
            }
        }

        tracing::info!(target_name = %self.name, "shutting down");
        self.disconnect().await
    }
}

fn expect_ack(reply: TargetReply) -> Result<(), LinkError> {
    match reply {
        TargetReply::Error { code, message } => Err(LinkError::Rejected { code, message }),
        _ => Ok(()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server refused ({code}): {message}")]
    Rejected { code: String, message: String },
}
