use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ApiError, RunnerApi};
use crate::job::{ExtraVars, JobStatus};
use crate::log::*;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub playbook: String,
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "ExtraVars::is_empty")]
    pub extra_vars: ExtraVars,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct RunResponse {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct CancelRequest<'a> {
    job_id: &'a str,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub progress: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybookEntry {
    pub name: String,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HostFacts {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct HostEntry {
    #[serde(default)]
    pub facts: Option<HostFacts>,
}

/// [`RunnerApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRunnerClient {
    client: reqwest::Client,
    base: String,
}

impl HttpRunnerClient {
    pub fn new<S: Into<String>>(base: S) -> color_eyre::eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client<S: Into<String>>(client: reqwest::Client, base: S) -> Self {
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Transport(url.clone(), e))?;
        decode(url, response).await
    }
}

async fn decode<T: DeserializeOwned>(url: String, response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(url));
    }
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::Transport(url.clone(), e))?;
    if !status.is_success() {
        return Err(ApiError::Status(url, status.as_u16(), body));
    }
    serde_json::from_str(&body).map_err(|e| ApiError::Decode(url, e.to_string()))
}

#[async_trait]
impl RunnerApi for HttpRunnerClient {
    #[tracing::instrument(skip(self))]
    async fn run(&self, request: &RunRequest) -> Result<String, ApiError> {
        let url = self.url("/api/run");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport(url.clone(), e))?;
        // The runner reports refusals as `{ "error": ... }`, sometimes with a
        // non-2xx status, so look at the body before the status code.
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(url.clone(), e))?;
        let parsed: RunResponse = serde_json::from_str(&body).unwrap_or_default();
        match (parsed.error, parsed.job_id) {
            (Some(error), _) => Err(ApiError::Rejected(error)),
            (None, Some(job_id)) if status.is_success() => {
                debug!("runner accepted {} as job {job_id}", request.playbook);
                Ok(job_id)
            }
            (None, _) if !status.is_success() => {
                Err(ApiError::Status(url, status.as_u16(), body))
            }
            (None, _) => Err(ApiError::Decode(url, "response has no job_id".into())),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn status(&self, job_id: &str) -> Result<StatusResponse, ApiError> {
        self.get_json(&format!("/api/status/{job_id}")).await
    }

    #[tracing::instrument(skip(self))]
    async fn cancel(&self, job_id: &str) -> Result<(), ApiError> {
        let url = self.url("/api/cancel");
        let response = self
            .client
            .post(&url)
            .json(&CancelRequest { job_id })
            .send()
            .await
            .map_err(|e| ApiError::Transport(url.clone(), e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Status(url, status.as_u16(), body))
        }
    }

    #[tracing::instrument(skip(self))]
    async fn playbooks(&self) -> Result<Vec<PlaybookEntry>, ApiError> {
        self.get_json("/api/playbooks").await
    }

    #[tracing::instrument(skip(self))]
    async fn hosts(&self) -> Result<HashMap<String, HostEntry>, ApiError> {
        self.get_json("/api/hosts").await
    }

    #[tracing::instrument(skip(self))]
    async fn host(&self, hostname: &str) -> Result<Option<HostFacts>, ApiError> {
        match self.get_json(&format!("/api/host/{hostname}")).await {
            Ok(facts) => Ok(Some(facts)),
            Err(ApiError::NotFound(url)) => {
                debug!("{url} is not served by this runner");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpListener};
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use color_eyre::eyre::Result;
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeRunner {
        runs: Vec<Value>,
        cancelled: Vec<String>,
    }

    type Shared = Arc<Mutex<FakeRunner>>;

    async fn run(State(state): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let mut state = state.lock().await;
        if body["hosts"].as_array().map(|h| h.is_empty()).unwrap_or(true) {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "no hosts" })));
        }
        state.runs.push(body);
        (StatusCode::OK, Json(json!({ "job_id": format!("job-{}", state.runs.len()) })))
    }

    async fn status(Path(job_id): Path<String>) -> (StatusCode, Json<Value>) {
        if job_id == "missing" {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})));
        }
        (
            StatusCode::OK,
            Json(json!({ "status": "success", "output": "PLAY [all]", "progress": 100 })),
        )
    }

    async fn cancel(State(state): State<Shared>, Json(body): Json<Value>) -> StatusCode {
        let id = body["job_id"].as_str().unwrap_or_default().to_string();
        state.lock().await.cancelled.push(id);
        StatusCode::OK
    }

    async fn serve(state: Shared) -> Result<SocketAddr> {
        let app = Router::new()
            .route("/api/run", post(run))
            .route("/api/status/:job_id", get(status))
            .route("/api/cancel", post(cancel))
            .route(
                "/api/playbooks",
                get(|| async { Json(json!([{ "name": "ping.yml", "path": "/srv/ping.yml" }])) }),
            )
            .route(
                "/api/hosts",
                get(|| async {
                    Json(json!({
                        "web01": { "facts": { "hostname": "web01", "private_ip": "10.0.0.5", "system": "Ubuntu 22.04" } }
                    }))
                }),
            )
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let server = axum::Server::from_tcp(listener)?.serve(app.into_make_service());
        tokio::spawn(server);
        Ok(addr)
    }

    #[tokio::test]
    async fn test_http_client_round_trips_runner_endpoints() -> Result<()> {
        let state = Shared::default();
        let addr = serve(state.clone()).await?;
        let client = HttpRunnerClient::new(format!("http://{addr}/"))?;

        let playbooks = client.playbooks().await?;
        assert_eq!("/srv/ping.yml", playbooks[0].path);

        let request = RunRequest {
            playbook: "/srv/ping.yml".into(),
            hosts: vec!["web01".into()],
            extra_vars: ExtraVars::new(),
        };
        assert_eq!("job-1", client.run(&request).await?);
        // empty extra vars are not sent at all
        assert!(state.lock().await.runs[0].get("extra_vars").is_none());

        let status = client.status("job-1").await?;
        assert_eq!(JobStatus::Completed, status.status);
        assert_eq!(Some(100.0), status.progress);

        client.cancel("job-1").await?;
        assert_eq!(vec!["job-1".to_string()], state.lock().await.cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn test_http_client_surfaces_runner_errors() -> Result<()> {
        let addr = serve(Shared::default()).await?;
        let client = HttpRunnerClient::new(format!("http://{addr}"))?;

        let request = RunRequest {
            playbook: "/srv/ping.yml".into(),
            hosts: vec![],
            extra_vars: ExtraVars::new(),
        };
        match client.run(&request).await {
            Err(ApiError::Rejected(message)) => assert_eq!("no hosts", message),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(matches!(
            client.status("missing").await,
            Err(ApiError::Status(_, 500, _))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_host_endpoint_is_not_an_error() -> Result<()> {
        let addr = serve(Shared::default()).await?;
        let client = HttpRunnerClient::new(format!("http://{addr}"))?;

        assert_eq!(None, client.host("web01").await?);
        let hosts = client.hosts().await?;
        let facts = hosts["web01"].facts.clone().unwrap_or_default();
        assert_eq!(Some("10.0.0.5".to_string()), facts.private_ip);
        Ok(())
    }
}
