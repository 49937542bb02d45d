//! The [`Tracker`] composes the registry, poller, correlator and hooks into
//! the submit / watch / view cycle a front end drives.
//!
//! Poll loops only send [`PollEvent`]s. Every mutation of tracked state
//! happens in [`Tracker::next_change`], under one lock, so readings are
//! applied in the order they were received.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};

use crate::baseline::BASELINE_KEYWORDS;
use crate::correlate::{Aggregate, HostCorrelator, MasterEntry, ResolutionSource};
use crate::error::SubmitError;
use crate::hooks::{playbook_matches, HookChain};
use crate::ipc::{ApiError, PlaybookEntry, RunRequest, RunnerApi};
use crate::job::{dedup_hosts, ExtraVars, Job, JobMetadata, JobRegistry, JobStatus, MASTER_JOB_VAR};
use crate::log::*;
use crate::parse::{lines_for_host, parse};
use crate::poll::{ChannelPollSink, PollConfig, PollEvent, PollRx, PollTx, StatusPoller};
use crate::render::{missing_output_notice, render, DisplayModel};

const EVENT_BUFFER: usize = 256;

fn default_submit_stagger_ms() -> u64 {
    1000
}

fn default_per_host_keywords() -> Vec<String> {
    BASELINE_KEYWORDS.iter().map(|k| k.to_string()).collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub poll: PollConfig,
    /// Pause between the single-host submissions of a per-host run.
    #[serde(default = "self::default_submit_stagger_ms")]
    pub submit_stagger_ms: u64,
    /// Playbooks whose name contains one of these run one job per host.
    #[serde(default = "self::default_per_host_keywords")]
    pub per_host_keywords: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            submit_stagger_ms: default_submit_stagger_ms(),
            per_host_keywords: default_per_host_keywords(),
        }
    }
}

impl TrackerConfig {
    pub fn is_per_host(&self, playbook_name: &str) -> bool {
        let keywords: Vec<&str> = self.per_host_keywords.iter().map(String::as_str).collect();
        playbook_matches(playbook_name, &keywords)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubmitRequest {
    /// Playbook name or path, as listed by the runner.
    pub playbook: String,
    pub hosts: Vec<String>,
    pub extra_vars: ExtraVars,
    /// Force (or forbid) one job per host instead of deciding from the name.
    pub per_host: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    pub hosts: Vec<String>,
}

#[derive(Debug)]
pub struct Submission {
    /// What to follow the submission by: the master key of a per-host run,
    /// otherwise the job id.
    pub key: String,
    pub jobs: Vec<SubmittedJob>,
    /// Hosts of a per-host run whose submission failed.
    pub failures: Vec<(String, SubmitError)>,
}

/// One applied poll event.
#[derive(Clone, Debug, PartialEq)]
pub struct JobChange {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    /// The master the job belongs to (or is) and its aggregate.
    pub master: Option<(String, Aggregate)>,
}

/// What a session was watching, enough to pick polling back up.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub jobs: Vec<Job>,
    pub masters: Vec<MasterEntry>,
}

impl SessionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.masters.is_empty()
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    registry: JobRegistry,
    correlator: HostCorrelator,
}

impl TrackerState {
    /// Register a job the runner accepted and tie it into correlation.
    fn track(&mut self, job_id: &str, metadata: JobMetadata) {
        let hosts = metadata.hosts().clone();
        let declared = metadata.declared_master().map(str::to_string);
        self.registry.register(job_id, metadata);

        match hosts.as_slice() {
            [host] => {
                self.correlator.note_individual(job_id, host);
                let master = declared.or_else(|| self.correlator.find_master_for(host, &self.registry));
                if let Some(master) = master {
                    self.correlator.associate(&master, job_id, host);
                }
            }
            _ => self.correlator.open_master(job_id, &hosts),
        }
        self.correlator.record(job_id, JobStatus::Running, None);
    }

    fn master_aggregate(&self, job_id: &str) -> Option<(String, Aggregate)> {
        let master = match self.correlator.master_of(job_id) {
            Some(master) => master.to_string(),
            None if self.correlator.master(job_id).is_some() => job_id.to_string(),
            None => return None,
        };
        let aggregate = self.correlator.aggregate_progress(&master);
        Some((master, aggregate))
    }

    fn apply(&mut self, event: PollEvent) -> Option<JobChange> {
        let (job_id, status, output, progress) = match event {
            PollEvent::Update(update) => (
                update.job_id,
                update.status,
                Some(update.output),
                update.progress,
            ),
            PollEvent::Terminal { job_id, status } => (job_id, status, None, None),
        };
        if !self
            .registry
            .apply_status(&job_id, status, output, progress)
        {
            return None;
        }
        let progress = self.correlator.record(&job_id, status, progress);
        let master = self.master_aggregate(&job_id);
        Some(JobChange {
            job_id,
            status,
            progress,
            master,
        })
    }
}

#[derive(Debug)]
pub struct Tracker {
    api: Arc<dyn RunnerApi>,
    config: TrackerConfig,
    hooks: HookChain,
    state: Arc<Mutex<TrackerState>>,
    poller: StatusPoller,
    tx: PollTx,
    rx: Mutex<PollRx>,
}

impl Tracker {
    pub fn new(api: Arc<dyn RunnerApi>, config: TrackerConfig, hooks: HookChain) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            poller: StatusPoller::new(api.clone(), config.poll.clone()),
            api,
            config,
            hooks,
            state: Arc::new(Mutex::new(TrackerState::default())),
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    async fn find_playbook(&self, wanted: &str) -> Result<PlaybookEntry, SubmitError> {
        self.api
            .playbooks()
            .await?
            .into_iter()
            .find(|entry| entry.name == wanted || entry.path == wanted)
            .ok_or_else(|| SubmitError::PlaybookNotFound(wanted.to_string()))
    }

    /// Submit a playbook. Per-host playbooks become one single-host job per
    /// host, submitted one after the other and grouped under a client-side
    /// master key; anything else is one job for all hosts.
    ///
    /// Hooks run over every payload before the first one is sent, so a
    /// rejected payload means nothing was submitted.
    #[tracing::instrument(skip(self, request), fields(playbook = %request.playbook))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, SubmitError> {
        let hosts = dedup_hosts(request.hosts);
        if hosts.is_empty() {
            return Err(SubmitError::NoHosts);
        }
        let playbook = self.find_playbook(&request.playbook).await?;
        let per_host = request
            .per_host
            .unwrap_or_else(|| self.config.is_per_host(&playbook.name));

        let master_key = per_host.then(|| {
            request
                .extra_vars
                .get(MASTER_JOB_VAR)
                .and_then(|value| value.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| new_master_key(&playbook.name))
        });

        let mut payloads: Vec<RunRequest> = match &master_key {
            Some(key) => hosts
                .iter()
                .map(|host| {
                    let mut extra_vars = request.extra_vars.clone();
                    extra_vars.insert(MASTER_JOB_VAR.to_string(), key.clone().into());
                    RunRequest {
                        playbook: playbook.path.clone(),
                        hosts: vec![host.clone()],
                        extra_vars,
                    }
                })
                .collect(),
            None => vec![RunRequest {
                playbook: playbook.path.clone(),
                hosts: hosts.clone(),
                extra_vars: request.extra_vars.clone(),
            }],
        };
        for payload in payloads.iter_mut() {
            self.hooks.run(&playbook.name, payload)?;
        }

        let Some(key) = master_key else {
            let payload = &payloads[0];
            let job_id = self.api.run(payload).await?;
            info!("submitted {} as job {job_id}", playbook.name);
            self.start(&job_id, metadata(&playbook, payload)).await;
            return Ok(Submission {
                key: job_id.clone(),
                jobs: vec![SubmittedJob {
                    job_id,
                    hosts,
                }],
                failures: vec![],
            });
        };

        self.state.lock().await.correlator.open_master(&key, &hosts);
        let mut jobs = vec![];
        let mut failures: Vec<(String, SubmitError)> = vec![];
        for (i, payload) in payloads.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.submit_stagger_ms)).await;
            }
            let host = payload.hosts[0].clone();
            match self.api.run(payload).await {
                Ok(job_id) => {
                    info!("submitted {} for {host} as job {job_id} (master {key})", playbook.name);
                    self.start(&job_id, metadata(&playbook, payload)).await;
                    jobs.push(SubmittedJob {
                        job_id,
                        hosts: vec![host],
                    });
                }
                Err(e) => {
                    error!("submitting {} for {host} failed, continuing: {e}", playbook.name);
                    failures.push((host, SubmitError::from(e)));
                }
            }
        }

        if jobs.is_empty() && !failures.is_empty() {
            self.state.lock().await.correlator.forget_master(&key);
            return Err(failures.swap_remove(0).1);
        }
        Ok(Submission {
            key,
            jobs,
            failures,
        })
    }

    async fn start(&self, job_id: &str, metadata: JobMetadata) {
        self.state.lock().await.track(job_id, metadata);
        self.poller.start(job_id, ChannelPollSink::new(self.tx.clone()));
    }

    /// Cancel a job, or every running job of a client-side master. Cancelled
    /// jobs stop being polled and leave the registry.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<Vec<String>, ApiError> {
        let targets: Vec<String> = {
            let state = self.state.lock().await;
            match state.correlator.master(job_id) {
                Some(master) if !state.registry.contains(job_id) => master
                    .individuals()
                    .iter()
                    .map(|a| a.job_id().clone())
                    .filter(|id| {
                        state
                            .registry
                            .get(id)
                            .map_or(false, |job| !job.status().is_terminal())
                    })
                    .collect(),
                _ => vec![job_id.to_string()],
            }
        };

        for target in &targets {
            self.api.cancel(target).await?;
            self.poller.stop(target);
            let mut state = self.state.lock().await;
            state.correlator.record(target, JobStatus::Cancelled, None);
            state.registry.remove(target);
            state.correlator.forget_job(target);
            info!("cancelled job {target}");
        }
        Ok(targets)
    }

    /// Wait for the next poll event and apply it. Events for jobs that are
    /// no longer tracked, or already finished, are skipped.
    pub async fn next_change(&self) -> Option<JobChange> {
        let mut rx = self.rx.lock().await;
        loop {
            let event = rx.recv().await?;
            trace!("applying poll event for {}", event.job_id());
            if let Some(change) = self.state.lock().await.apply(event) {
                return Some(change);
            }
        }
    }

    /// Whether no tracked job is still running.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.registry.all_terminal()
    }

    pub fn is_polling(&self, job_id: &str) -> bool {
        self.poller.is_polling(job_id)
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.state.lock().await.registry.get(job_id).cloned()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .await
            .registry
            .jobs()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn master(&self, master_id: &str) -> Option<MasterEntry> {
        self.state.lock().await.correlator.master(master_id).cloned()
    }

    pub async fn aggregate(&self, master_id: &str) -> Aggregate {
        self.state.lock().await.correlator.aggregate_progress(master_id)
    }

    /// The rendered output of one host, where `key` is a master key or a
    /// job id. When no job of the host's own is known the master's output is
    /// used, narrowed to the host.
    #[tracing::instrument(skip(self))]
    pub async fn host_view(&self, key: &str, hostname: &str) -> DisplayModel {
        let (job_id, source, cached) = {
            let state = self.state.lock().await;
            let resolution = state
                .correlator
                .master(key)
                .and_then(|_| state.correlator.resolve(key, &[hostname.to_string()]).pop());
            let (job_id, source) = match resolution {
                Some(resolution) => (resolution.job_id().clone(), *resolution.source()),
                None => (key.to_string(), ResolutionSource::Associated),
            };
            let cached = state
                .registry
                .get(&job_id)
                .map(|job| job.output().clone())
                .filter(|output| !output.is_empty());
            // a client-side master key is not a runner job
            let fetchable =
                state.registry.contains(&job_id) || state.correlator.master(&job_id).is_none();
            (job_id, source, cached.or_else(|| (!fetchable).then(String::new)))
        };

        let output = match cached {
            Some(output) => output,
            None => match self.api.status(&job_id).await {
                Ok(response) => response.output,
                Err(e) => {
                    warn!("could not fetch output of {job_id}: {e}");
                    String::new()
                }
            },
        };
        debug!("showing {hostname} from job {job_id} ({source:?})");

        if source != ResolutionSource::Master {
            return render(hostname, &parse(&output));
        }
        let parsed = parse(&output);
        if parsed.hosts().iter().any(|h| h == hostname) {
            return render(hostname, &parsed);
        }
        let narrowed = lines_for_host(&output, hostname);
        if narrowed.is_empty() {
            return DisplayModel::only_notice(hostname, missing_output_notice(hostname));
        }
        render(hostname, &parse(&narrowed))
            .with_notice(format!("showing the lines of {job_id} that mention {hostname}"))
    }

    /// The hosts a master key or job id covers.
    pub async fn hosts_of(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().await;
        match state.correlator.master(key) {
            Some(master) => master.hosts().clone(),
            None => state
                .registry
                .get(key)
                .map(|job| job.hosts().to_vec())
                .unwrap_or_default(),
        }
    }

    /// [`Tracker::host_view`] for every host of `key`, in host order.
    pub async fn host_views(&self, key: &str) -> Vec<DisplayModel> {
        let hosts = self.hosts_of(key).await;
        join_all(hosts.iter().map(|host| self.host_view(key, host))).await
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            jobs: state.registry.jobs().into_iter().cloned().collect(),
            masters: state.correlator.masters().into_iter().cloned().collect(),
        }
    }

    /// Load a snapshot and resume polling of its unfinished jobs.
    #[tracing::instrument(skip(self, snapshot), fields(jobs = snapshot.jobs.len()))]
    pub async fn restore(&self, snapshot: SessionSnapshot) {
        let mut resume = vec![];
        {
            let mut state = self.state.lock().await;
            for master in &snapshot.masters {
                state.correlator.open_master(master.master_id(), master.hosts());
                for association in master.individuals() {
                    state.correlator.note_individual(association.job_id(), association.hostname());
                    state.correlator.associate(
                        master.master_id(),
                        association.job_id(),
                        association.hostname(),
                    );
                }
            }
            for job in snapshot.jobs {
                state
                    .correlator
                    .record(job.job_id(), *job.status(), *job.progress());
                if !job.status().is_terminal() {
                    resume.push(job.job_id().clone());
                }
                state.registry.restore(job);
            }
        }
        for job_id in resume {
            info!("resuming job {job_id}");
            self.poller.start(&job_id, ChannelPollSink::new(self.tx.clone()));
        }
    }
}

fn metadata(playbook: &PlaybookEntry, payload: &RunRequest) -> JobMetadata {
    JobMetadata::new(
        playbook.name.as_str(),
        playbook.path.as_str(),
        payload.hosts.clone(),
        payload.extra_vars.clone(),
    )
}

/// `<playbook>_<unix millis>`.
fn new_master_key(playbook_name: &str) -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    format!("{playbook_name}_{millis}")
}
