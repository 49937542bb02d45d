use std::collections::HashMap;

use super::{Job, JobMetadata, JobStatus};
use crate::log::*;

/// In-memory map of job id to [`Job`]. Owned by whoever composes the client
/// (usually the [`crate::tracker::Tracker`]) and passed by reference to the
/// components that need it.
#[derive(Debug, Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Job>,
    next_order: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job, or overwrite an existing one. Overwriting with different
    /// metadata is logged; the last write wins.
    #[tracing::instrument(skip(self, metadata))]
    pub fn register<S: Into<String> + std::fmt::Debug>(&mut self, job_id: S, metadata: JobMetadata) {
        let job_id = job_id.into();
        if let Some(existing) = self.jobs.get(&job_id) {
            if existing.metadata() != &metadata {
                warn!("job {job_id} re-registered with different metadata, overwriting");
            }
        }
        self.next_order += 1;
        debug!("registered job {job_id} ({})", metadata.playbook_name());
        self.jobs
            .insert(job_id.clone(), Job::new(job_id, metadata, self.next_order));
    }

    /// Re-insert a job exactly as it was, e.g. from a session snapshot.
    pub(crate) fn restore(&mut self, mut job: Job) {
        self.next_order += 1;
        job.order = self.next_order;
        self.jobs.insert(job.job_id().clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn remove(&mut self, job_id: &str) -> Option<Job> {
        let removed = self.jobs.remove(job_id);
        if removed.is_some() {
            debug!("removed job {job_id}");
        }
        removed
    }

    /// Apply a status reading. Jobs that already reached a terminal status
    /// are left untouched; returns whether anything was applied.
    pub fn apply_status(
        &mut self,
        job_id: &str,
        status: JobStatus,
        output: Option<String>,
        progress: Option<f64>,
    ) -> bool {
        let Some(job) = self.jobs.get_mut(job_id) else {
            trace!("status for unknown job {job_id} ignored");
            return false;
        };
        if job.status.is_terminal() {
            trace!("job {job_id} is already {}, ignoring {status}", job.status);
            return false;
        }
        job.status = status;
        if let Some(output) = output {
            job.output = output;
        }
        if progress.is_some() {
            job.progress = progress;
        }
        true
    }

    /// All jobs, oldest first.
    pub fn jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|job| job.order);
        jobs
    }

    pub fn running(&self) -> Vec<&Job> {
        self.jobs()
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.jobs.values().all(|job| job.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ExtraVars;

    fn meta(playbook: &str, hosts: &[&str]) -> JobMetadata {
        JobMetadata::new(
            playbook.to_string(),
            format!("/playbooks/{playbook}"),
            hosts.iter().map(|h| h.to_string()).collect(),
            ExtraVars::new(),
        )
    }

    #[test]
    fn test_register_overwrites_last_write_wins() {
        let mut registry = JobRegistry::new();
        registry.register("job-1", meta("ping.yml", &["h1"]));
        registry.register("job-1", meta("update.yml", &["h2"]));
        assert_eq!(1, registry.len());
        let job = registry.get("job-1").unwrap();
        assert_eq!("update.yml", job.playbook_name());
        assert_eq!(&["h2".to_string()], job.hosts());
    }

    #[test]
    fn test_terminal_jobs_are_immutable() {
        let mut registry = JobRegistry::new();
        registry.register("job-1", meta("ping.yml", &["h1"]));
        assert!(registry.apply_status("job-1", JobStatus::Running, Some("TASK [a]".into()), Some(10.0)));
        assert!(registry.apply_status("job-1", JobStatus::Completed, Some("done".into()), None));
        assert!(!registry.apply_status("job-1", JobStatus::Failed, Some("late".into()), None));

        let job = registry.get("job-1").unwrap();
        assert_eq!(&JobStatus::Completed, job.status());
        assert_eq!("done", job.output());
        assert_eq!(&Some(10.0), job.progress());
        assert!(registry.all_terminal());
    }

    #[test]
    fn test_jobs_are_listed_in_creation_order() {
        let mut registry = JobRegistry::new();
        registry.register("b", meta("ping.yml", &["h1"]));
        registry.register("a", meta("ping.yml", &["h2"]));
        let ids: Vec<&str> = registry.jobs().iter().map(|j| j.job_id().as_str()).collect();
        assert_eq!(vec!["b", "a"], ids);
        assert_eq!(2, registry.running().len());

        registry.remove("b");
        registry.remove("b");
        assert_eq!(1, registry.len());
    }
}
