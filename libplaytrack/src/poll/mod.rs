//! Polling of `GET /api/status/{job_id}` with adaptive backoff.
//!
//! Each polled job gets its own loop on the runtime. Loops never touch
//! shared state: they hand every reading to a [`PollSink`], normally a
//! [`ChannelPollSink`] whose receiving end is drained by a single consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipc::RunnerApi;
use crate::job::JobStatus;
use crate::log::*;

fn default_initial_interval_ms() -> u64 {
    1000
}

fn default_max_interval_ms() -> u64 {
    10_000
}

fn default_backoff() -> f64 {
    1.5
}

fn default_error_retries() -> u32 {
    2
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "self::default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "self::default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "self::default_backoff")]
    pub backoff: f64,
    /// Consecutive failed ticks tolerated before the job is reported as
    /// failed. `0` fails on the first error.
    #[serde(default = "self::default_error_retries")]
    pub error_retries: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            backoff: default_backoff(),
            error_retries: default_error_retries(),
        }
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms.min(self.max_interval_ms))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// The wait after `current` when the job is still running. A backoff
    /// below 1 or not finite falls back to the default.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let backoff = if self.backoff.is_finite() && self.backoff >= 1.0 {
            self.backoff
        } else {
            default_backoff()
        };
        let max = self.max_interval().as_secs_f64();
        Duration::from_secs_f64((current.as_secs_f64() * backoff).min(max))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub job_id: String,
    /// Per-job request sequence number, see [`SequenceGuard`].
    pub seq: u64,
    pub status: JobStatus,
    pub output: String,
    pub progress: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollEvent {
    Update(StatusUpdate),
    Terminal { job_id: String, status: JobStatus },
}

impl PollEvent {
    pub fn job_id(&self) -> &str {
        match self {
            PollEvent::Update(update) => &update.job_id,
            PollEvent::Terminal { job_id, .. } => job_id,
        }
    }
}

/// Receives the readings of a poll loop.
#[async_trait]
pub trait PollSink: std::fmt::Debug + Send {
    async fn update(&mut self, update: StatusUpdate) -> Result<()>;

    /// Called once, when the job leaves `running` or polling gives up.
    async fn terminal(&mut self, job_id: &str, status: JobStatus) -> Result<()>;
}

pub type PollTx = mpsc::Sender<PollEvent>;
pub type PollRx = mpsc::Receiver<PollEvent>;

#[derive(Debug, Clone)]
pub struct ChannelPollSink {
    tx: PollTx,
}

impl ChannelPollSink {
    pub fn new(tx: PollTx) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl PollSink for ChannelPollSink {
    async fn update(&mut self, update: StatusUpdate) -> Result<()> {
        self.tx
            .send(PollEvent::Update(update))
            .await
            .wrap_err("poll event receiver dropped")
    }

    async fn terminal(&mut self, job_id: &str, status: JobStatus) -> Result<()> {
        self.tx
            .send(PollEvent::Terminal {
                job_id: job_id.to_string(),
                status,
            })
            .await
            .wrap_err("poll event receiver dropped")
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Sequence {
    issued: u64,
    applied: u64,
}

/// Hands out increasing sequence numbers per job and refuses to apply a
/// response older than the newest one already applied, so a slow response
/// can never overwrite a fresher one.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    sequences: Mutex<HashMap<String, Sequence>>,
}

impl SequenceGuard {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Sequence>> {
        self.sequences.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn issue(&self, job_id: &str) -> u64 {
        let mut sequences = self.lock();
        let sequence = sequences.entry(job_id.to_string()).or_default();
        sequence.issued += 1;
        sequence.issued
    }

    pub fn try_apply(&self, job_id: &str, seq: u64) -> bool {
        let mut sequences = self.lock();
        let sequence = sequences.entry(job_id.to_string()).or_default();
        if seq > sequence.applied {
            sequence.applied = seq;
            true
        } else {
            false
        }
    }

    pub fn forget(&self, job_id: &str) {
        self.lock().remove(job_id);
    }
}

#[derive(Debug)]
pub struct StatusPoller {
    api: Arc<dyn RunnerApi>,
    config: PollConfig,
    loops: Loops,
    guard: Arc<SequenceGuard>,
}

type Loops = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock_loops(
    loops: &Mutex<HashMap<String, CancellationToken>>,
) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    loops.lock().unwrap_or_else(|e| e.into_inner())
}

impl StatusPoller {
    pub fn new(api: Arc<dyn RunnerApi>, config: PollConfig) -> Self {
        Self {
            api,
            config,
            loops: Arc::new(Mutex::new(HashMap::new())),
            guard: Arc::new(SequenceGuard::default()),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        lock_loops(&self.loops)
    }

    /// Start polling `job_id`, replacing any loop already polling it.
    #[tracing::instrument(skip(self, sink))]
    pub fn start<S: PollSink + 'static>(&self, job_id: &str, sink: S) {
        let token = CancellationToken::new();
        if let Some(previous) = self.loops().insert(job_id.to_string(), token.clone()) {
            previous.cancel();
            debug!("replaced poll loop for {job_id}");
        }
        debug!("starting poll loop for {job_id}");
        tokio::spawn(poll_loop(
            self.api.clone(),
            self.config.clone(),
            self.guard.clone(),
            self.loops.clone(),
            job_id.to_string(),
            token,
            sink,
        ));
    }

    /// Stop polling `job_id`. Safe to call when nothing is polling it;
    /// returns whether a live loop was stopped.
    pub fn stop(&self, job_id: &str) -> bool {
        match self.loops().remove(job_id) {
            Some(token) => {
                let was_live = !token.is_cancelled();
                token.cancel();
                if was_live {
                    debug!("stopped poll loop for {job_id}");
                }
                was_live
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for (_, token) in self.loops().drain() {
            token.cancel();
        }
    }

    pub fn is_polling(&self, job_id: &str) -> bool {
        self.loops()
            .get(job_id)
            .map_or(false, |token| !token.is_cancelled())
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[tracing::instrument(skip(api, config, guard, loops, token, sink))]
async fn poll_loop<S: PollSink>(
    api: Arc<dyn RunnerApi>,
    config: PollConfig,
    guard: Arc<SequenceGuard>,
    loops: Loops,
    job_id: String,
    token: CancellationToken,
    mut sink: S,
) {
    poll_until_done(&*api, &config, &guard, &job_id, &token, &mut sink).await;
    token.cancel();

    // the entry may already belong to a loop that replaced this one
    let mut active = lock_loops(&loops);
    let replaced = active.get(&job_id).map_or(false, |t| !t.is_cancelled());
    if !replaced {
        active.remove(&job_id);
        guard.forget(&job_id);
    }
}

async fn poll_until_done<S: PollSink>(
    api: &dyn RunnerApi,
    config: &PollConfig,
    guard: &SequenceGuard,
    job_id: &str,
    token: &CancellationToken,
    sink: &mut S,
) {
    let job_id = job_id.to_string();
    let mut interval = config.initial_interval();
    let mut failures = 0;

    loop {
        if token.is_cancelled() {
            return;
        }
        let seq = guard.issue(&job_id);
        let result = api.status(&job_id).await;
        if token.is_cancelled() {
            trace!("poll for {job_id} stopped, dropping response #{seq}");
            return;
        }

        match result {
            Ok(response) => {
                failures = 0;
                let status = response.status;
                if guard.try_apply(&job_id, seq) {
                    let update = StatusUpdate {
                        job_id: job_id.clone(),
                        seq,
                        status,
                        output: response.output,
                        progress: response.progress,
                    };
                    if let Err(e) = sink.update(update).await {
                        warn!("dropping poll loop for {job_id}: {e}");
                        token.cancel();
                        return;
                    }
                } else {
                    trace!("stale response #{seq} for {job_id} ignored");
                }

                if status.is_terminal() {
                    info!("job {job_id} finished: {status}");
                    finish(sink, &job_id, status, token).await;
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                if failures > config.error_retries {
                    error!("polling {job_id} failed {failures} time(s), marking it failed: {e}");
                    finish(sink, &job_id, JobStatus::Failed, token).await;
                    return;
                }
                warn!(
                    "polling {job_id} failed ({failures}/{}), retrying: {e}",
                    config.error_retries
                );
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                trace!("poll for {job_id} stopped while waiting");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        if failures == 0 {
            interval = config.next_interval(interval);
        }
    }
}

async fn finish<S: PollSink>(sink: &mut S, job_id: &str, status: JobStatus, token: &CancellationToken) {
    if let Err(e) = sink.terminal(job_id, status).await {
        warn!("could not report terminal status of {job_id}: {e}");
    }
    token.cancel();
}
