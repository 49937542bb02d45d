//! An in-memory runner for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ApiError, HostEntry, HostFacts, PlaybookEntry, RunRequest, RunnerApi, StatusResponse};
use crate::job::JobStatus;

/// One scripted answer to `GET /api/status/{id}`; `Err` carries an HTTP code.
pub(crate) type Step = Result<StatusResponse, u16>;

pub(crate) fn running(progress: f64) -> Step {
    Ok(StatusResponse {
        status: JobStatus::Running,
        output: String::new(),
        progress: Some(progress),
    })
}

pub(crate) fn finished(status: JobStatus, output: &str) -> Step {
    Ok(StatusResponse {
        status,
        output: output.to_string(),
        progress: Some(100.0),
    })
}

#[derive(Debug, Default)]
struct State {
    playbooks: Vec<PlaybookEntry>,
    runs: Vec<RunRequest>,
    scripts: HashMap<String, VecDeque<Step>>,
    last: HashMap<String, StatusResponse>,
    cancelled: Vec<String>,
    rejected_hosts: Vec<String>,
    status_calls: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeRunner {
    state: Mutex<State>,
}

impl FakeRunner {
    pub(crate) fn with_playbooks(playbooks: &[(&str, &str)]) -> Self {
        let runner = Self::default();
        runner.lock().playbooks = playbooks
            .iter()
            .map(|(name, path)| PlaybookEntry {
                name: name.to_string(),
                path: path.to_string(),
            })
            .collect();
        runner
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn script(&self, job_id: &str, steps: Vec<Step>) {
        self.lock().scripts.insert(job_id.to_string(), steps.into());
    }

    pub(crate) fn reject_host(&self, host: &str) {
        self.lock().rejected_hosts.push(host.to_string());
    }

    pub(crate) fn runs(&self) -> Vec<RunRequest> {
        self.lock().runs.clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    /// How often `GET /api/status/{job_id}` was asked for `job_id`.
    pub(crate) fn status_calls(&self, job_id: &str) -> usize {
        self.lock().status_calls.get(job_id).copied().unwrap_or_default()
    }
}

#[async_trait]
impl RunnerApi for FakeRunner {
    async fn run(&self, request: &RunRequest) -> Result<String, ApiError> {
        let mut state = self.lock();
        if let Some(host) = request
            .hosts
            .iter()
            .find(|h| state.rejected_hosts.contains(h))
        {
            return Err(ApiError::Rejected(format!("host {host} is unreachable")));
        }
        state.runs.push(request.clone());
        Ok(format!("job-{}", state.runs.len()))
    }

    async fn status(&self, job_id: &str) -> Result<StatusResponse, ApiError> {
        let mut state = self.lock();
        *state.status_calls.entry(job_id.to_string()).or_default() += 1;
        let step = state.scripts.get_mut(job_id).and_then(VecDeque::pop_front);
        match step {
            Some(Ok(response)) => {
                state.last.insert(job_id.to_string(), response.clone());
                Ok(response)
            }
            Some(Err(code)) => Err(ApiError::Status(job_id.to_string(), code, String::new())),
            None => Ok(state.last.get(job_id).cloned().unwrap_or(StatusResponse {
                status: JobStatus::Running,
                output: String::new(),
                progress: None,
            })),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<(), ApiError> {
        self.lock().cancelled.push(job_id.to_string());
        Ok(())
    }

    async fn playbooks(&self) -> Result<Vec<PlaybookEntry>, ApiError> {
        Ok(self.lock().playbooks.clone())
    }

    async fn hosts(&self) -> Result<HashMap<String, HostEntry>, ApiError> {
        Ok(HashMap::new())
    }

    async fn host(&self, _hostname: &str) -> Result<Option<HostFacts>, ApiError> {
        Ok(None)
    }
}
