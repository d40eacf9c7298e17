//! Worker-side registration with the master.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::master::{RegisterWorkerRequest, RegisterWorkerResponse, RegistrationError};
use crate::retry::RetryPolicy;
use crate::worker::{WorkerId, WorkerNetAddress};

/// One registration attempt against the master.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn register_worker(
        &self,
        request: &RegisterWorkerRequest,
    ) -> Result<WorkerId, RegistrationError>;
}

/// Talks to the master's HTTP API.
pub struct HttpMasterClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMasterClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RegistrationError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl MasterClient for HttpMasterClient {
    async fn register_worker(
        &self,
        request: &RegisterWorkerRequest,
    ) -> Result<WorkerId, RegistrationError> {
        let url = format!("{}/api/v1/workers/register", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RegistrationError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let body: RegisterWorkerResponse = response
            .json()
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))?;
        Ok(body.worker_id)
    }
}

/// Obtains this process's worker id, retrying transient failures with backoff.
///
/// The id is requested at most once per client: later calls return the id
/// already obtained without contacting the master.
pub struct MasterRegistrationClient {
    master: Arc<dyn MasterClient>,
    policy: RetryPolicy,
    worker_id: OnceCell<WorkerId>,
}

impl MasterRegistrationClient {
    pub fn new(master: Arc<dyn MasterClient>, policy: RetryPolicy) -> Self {
        Self {
            master,
            policy,
            worker_id: OnceCell::new(),
        }
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id.get().copied()
    }

    pub async fn register(
        &self,
        address: &WorkerNetAddress,
        start_time_ms: u64,
    ) -> Result<WorkerId, RegistrationError> {
        let request = RegisterWorkerRequest {
            address: address.clone(),
            start_time_ms,
        };
        self.worker_id
            .get_or_try_init(|| self.register_with_retry(request))
            .await
            .copied()
    }

    async fn register_with_retry(
        &self,
        request: RegisterWorkerRequest,
    ) -> Result<WorkerId, RegistrationError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;
        loop {
            match self.master.register_worker(&request).await {
                Ok(id) => {
                    info!(worker_id = id, attempt, "Registered with master");
                    return Ok(id);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(RegistrationError::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let backoff = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Registration failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
