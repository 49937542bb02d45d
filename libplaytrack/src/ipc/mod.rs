//! The runner's HTTP API, behind a trait so the rest of the crate never talks
//! to the network directly.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
pub(crate) mod fake;
pub mod http;

pub use http::{
    HostEntry, HostFacts, HttpRunnerClient, PlaybookEntry, RunRequest, StatusResponse,
};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request to `{0}` failed: {1}")]
    Transport(String, #[source] reqwest::Error),
    #[error("`{0}` returned HTTP {1}: {2}")]
    Status(String, u16, String),
    #[error("runner rejected the request: {0}")]
    Rejected(String),
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("could not decode response from `{0}`: {1}")]
    Decode(String, String),
}

/// The endpoints of the remote runner this crate is a client of.
#[async_trait]
pub trait RunnerApi: std::fmt::Debug + Send + Sync {
    /// `POST /api/run`. Returns the id the runner assigned to the job.
    async fn run(&self, request: &RunRequest) -> Result<String, ApiError>;

    /// `GET /api/status/{job_id}`.
    async fn status(&self, job_id: &str) -> Result<StatusResponse, ApiError>;

    /// `POST /api/cancel`.
    async fn cancel(&self, job_id: &str) -> Result<(), ApiError>;

    /// `GET /api/playbooks`.
    async fn playbooks(&self) -> Result<Vec<PlaybookEntry>, ApiError>;

    /// `GET /api/hosts`, keyed by hostname.
    async fn hosts(&self) -> Result<HashMap<String, HostEntry>, ApiError>;

    /// `GET /api/host/{hostname}`. `Ok(None)` when the runner does not serve
    /// this endpoint or does not know the host.
    async fn host(&self, hostname: &str) -> Result<Option<HostFacts>, ApiError>;
}
