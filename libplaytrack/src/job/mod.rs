//! Jobs submitted to the runner and the registry that tracks them.

use std::collections::BTreeMap;
use std::fmt;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod registry;

pub use registry::JobRegistry;

/// Opaque variables forwarded to the runner with a submission.
pub type ExtraVars = BTreeMap<String, serde_json::Value>;

/// Extra var naming the multi-host job an individual submission belongs to.
pub const MASTER_JOB_VAR: &str = "master_job_id";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    #[serde(alias = "success")]
    Completed,
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything known about a job at submission time.
#[derive(Getters, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobMetadata {
    playbook_name: String,
    playbook_path: String,
    hosts: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(default)]
    extra_vars: ExtraVars,
}

impl JobMetadata {
    /// Hosts are de-duplicated, keeping their first position.
    pub fn new<S: Into<String>>(
        playbook_name: S,
        playbook_path: S,
        hosts: Vec<String>,
        extra_vars: ExtraVars,
    ) -> Self {
        Self {
            playbook_name: playbook_name.into(),
            playbook_path: playbook_path.into(),
            hosts: dedup_hosts(hosts),
            created_at: OffsetDateTime::now_utc(),
            extra_vars,
        }
    }

    /// The master job this submission declared itself part of, if any.
    pub fn declared_master(&self) -> Option<&str> {
        self.extra_vars
            .get(MASTER_JOB_VAR)
            .and_then(|value| value.as_str())
    }
}

/// One execution instance of a playbook on the runner.
#[derive(Getters, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Job {
    job_id: String,
    #[serde(flatten)]
    metadata: JobMetadata,
    status: JobStatus,
    #[serde(default)]
    output: String,
    #[serde(default)]
    progress: Option<f64>,
    #[getter(skip)]
    #[serde(default)]
    order: u64,
}

impl Job {
    pub(crate) fn new(job_id: String, metadata: JobMetadata, order: u64) -> Self {
        Self {
            job_id,
            metadata,
            status: JobStatus::Running,
            output: String::new(),
            progress: None,
            order,
        }
    }

    pub fn playbook_name(&self) -> &str {
        &self.metadata.playbook_name
    }

    pub fn hosts(&self) -> &[String] {
        &self.metadata.hosts
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.metadata.created_at
    }

    /// Creation order within the registry. Later registrations compare
    /// greater, even when their timestamps are equal.
    pub fn order(&self) -> u64 {
        self.order
    }
}

pub fn dedup_hosts(hosts: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(hosts.len());
    for host in hosts {
        let host = host.trim().to_string();
        if !host.is_empty() && !out.contains(&host) {
            out.push(host);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accepts_runner_aliases() -> color_eyre::eyre::Result<()> {
        let status: JobStatus = serde_json::from_str("\"success\"")?;
        assert_eq!(JobStatus::Completed, status);
        let status: JobStatus = serde_json::from_str("\"canceled\"")?;
        assert_eq!(JobStatus::Cancelled, status);
        assert_eq!("\"running\"", serde_json::to_string(&JobStatus::Running)?);
        Ok(())
    }

    #[test]
    fn test_hosts_are_deduplicated_in_order() {
        let meta = JobMetadata::new(
            "ping",
            "/playbooks/ping.yml",
            vec!["h2".into(), "h1".into(), "h2".into(), " ".into()],
            ExtraVars::new(),
        );
        assert_eq!(&vec!["h2".to_string(), "h1".to_string()], meta.hosts());
    }

    #[test]
    fn test_declared_master_reads_extra_var() {
        let mut vars = ExtraVars::new();
        vars.insert(MASTER_JOB_VAR.into(), "baseline.yml_1700000000000".into());
        let meta = JobMetadata::new("baseline.yml", "/p/baseline.yml", vec!["h1".into()], vars);
        assert_eq!(Some("baseline.yml_1700000000000"), meta.declared_master());
    }
}
