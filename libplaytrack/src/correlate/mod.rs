//! Correlation of single-host jobs with the multi-host ("master") job they
//! were split from.
//!
//! A master is either a real runner job targeting several hosts, or a
//! client-side key grouping sequential single-host submissions. Individual
//! jobs are tied to a master either explicitly (the `master_job_id` extra
//! var) or by best-effort matching on host membership.

use std::collections::{HashMap, VecDeque};

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::job::{JobRegistry, JobStatus};
use crate::log::*;

/// How many recent single-host jobs are remembered for rule (b) of
/// [`HostCorrelator::resolve`].
pub const RECENT_JOBS_CAP: usize = 20;

/// Running jobs never report more than this towards an aggregate; only a
/// terminal status counts as done.
pub const RUNNING_PROGRESS_CAP: f64 = 90.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionSource {
    /// An individual job already associated with the master.
    Associated,
    /// A recent single-host job for the host.
    Recent,
    /// Nothing better was known; the master's own output must be filtered.
    Master,
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    job_id: String,
    hostname: String,
    source: ResolutionSource,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub progress: f64,
    pub status: JobStatus,
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    job_id: String,
    hostname: String,
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEntry {
    master_id: String,
    hosts: Vec<String>,
    individuals: Vec<Association>,
    #[getter(skip)]
    order: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct Reading {
    status: JobStatus,
    progress: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RecentJob {
    job_id: String,
    hostname: String,
}

#[derive(Debug, Default, Clone)]
pub struct HostCorrelator {
    masters: HashMap<String, MasterEntry>,
    owners: HashMap<String, String>,
    recent: VecDeque<RecentJob>,
    readings: HashMap<String, Reading>,
    next_order: u64,
}

impl HostCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a master and the hosts it targets. Re-opening an existing
    /// master merges the host sets and keeps its associations.
    pub fn open_master<S: Into<String>>(&mut self, master_id: S, hosts: &[String]) {
        let master_id = master_id.into();
        self.next_order += 1;
        let order = self.next_order;
        let entry = self
            .masters
            .entry(master_id.clone())
            .or_insert_with(|| MasterEntry {
                master_id,
                hosts: vec![],
                individuals: vec![],
                order,
            });
        for host in hosts {
            if !entry.hosts.contains(host) {
                entry.hosts.push(host.clone());
            }
        }
    }

    pub fn master(&self, master_id: &str) -> Option<&MasterEntry> {
        self.masters.get(master_id)
    }

    pub fn masters(&self) -> Vec<&MasterEntry> {
        let mut masters: Vec<&MasterEntry> = self.masters.values().collect();
        masters.sort_by_key(|m| m.order);
        masters
    }

    /// The master an individual job belongs to.
    pub fn master_of(&self, job_id: &str) -> Option<&str> {
        self.owners.get(job_id).map(String::as_str)
    }

    /// Remember a single-host job so later lookups for its host can find it.
    pub fn note_individual(&mut self, job_id: &str, hostname: &str) {
        self.recent.retain(|recent| recent.job_id != job_id);
        self.recent.push_back(RecentJob {
            job_id: job_id.to_string(),
            hostname: hostname.to_string(),
        });
        while self.recent.len() > RECENT_JOBS_CAP {
            self.recent.pop_front();
        }
    }

    /// Tie an individual job to a master. Idempotent; an individual that
    /// already belongs to another master is left alone and `false` returned.
    #[tracing::instrument(skip(self))]
    pub fn associate(&mut self, master_id: &str, job_id: &str, hostname: &str) -> bool {
        match self.owners.get(job_id) {
            Some(owner) if owner == master_id => return true,
            Some(owner) => {
                warn!("job {job_id} already belongs to master {owner}, not moving it to {master_id}");
                return false;
            }
            None => {}
        }
        if !self.masters.contains_key(master_id) {
            self.open_master(master_id, &[hostname.to_string()]);
        }
        if let Some(entry) = self.masters.get_mut(master_id) {
            if !entry.hosts.iter().any(|h| h == hostname) {
                entry.hosts.push(hostname.to_string());
            }
            entry.individuals.push(Association {
                job_id: job_id.to_string(),
                hostname: hostname.to_string(),
            });
        }
        self.owners.insert(job_id.to_string(), master_id.to_string());
        debug!("associated job {job_id} ({hostname}) with master {master_id}");
        true
    }

    /// For each host, the job whose output should be shown for it.
    pub fn resolve(&self, master_id: &str, hosts: &[String]) -> Vec<Resolution> {
        hosts
            .iter()
            .map(|host| {
                let associated = self.masters.get(master_id).and_then(|entry| {
                    entry
                        .individuals
                        .iter()
                        .rev()
                        .find(|a| &a.hostname == host)
                });
                if let Some(association) = associated {
                    return Resolution {
                        job_id: association.job_id.clone(),
                        hostname: host.clone(),
                        source: ResolutionSource::Associated,
                    };
                }

                let recent = self.recent.iter().rev().find(|recent| {
                    &recent.hostname == host
                        && self
                            .owners
                            .get(&recent.job_id)
                            .map_or(true, |owner| owner == master_id)
                });
                if let Some(recent) = recent {
                    return Resolution {
                        job_id: recent.job_id.clone(),
                        hostname: host.clone(),
                        source: ResolutionSource::Recent,
                    };
                }

                Resolution {
                    job_id: master_id.to_string(),
                    hostname: host.clone(),
                    source: ResolutionSource::Master,
                }
            })
            .collect()
    }

    /// Record a status reading for any job. A reading lower than the job's
    /// previous one is raised to it; terminal readings count as 100. Returns
    /// the progress that was kept.
    pub fn record(&mut self, job_id: &str, status: JobStatus, progress: Option<f64>) -> f64 {
        let previous = self.readings.get(job_id).map_or(0.0, |r| r.progress);
        let reported = if status.is_terminal() {
            100.0
        } else {
            progress.unwrap_or(previous).clamp(0.0, 100.0)
        };
        let kept = reported.max(previous);
        self.readings.insert(
            job_id.to_string(),
            Reading {
                status,
                progress: kept,
            },
        );
        kept
    }

    /// Progress and status of a master over its individual jobs.
    pub fn aggregate_progress(&self, master_id: &str) -> Aggregate {
        let individuals = self
            .masters
            .get(master_id)
            .map(|entry| entry.individuals.as_slice())
            .unwrap_or_default();

        if individuals.is_empty() {
            // a batch job tracks itself
            return match self.readings.get(master_id) {
                Some(reading) => Aggregate {
                    progress: reading.progress,
                    status: reading.status,
                },
                None => Aggregate {
                    progress: 0.0,
                    status: JobStatus::Running,
                },
            };
        }

        let mut total = 0.0;
        let mut completed = 0;
        let mut failed = 0;
        for association in individuals {
            // jobs that never reported count as 0
            if let Some(reading) = self.readings.get(&association.job_id) {
                total += match reading.status {
                    JobStatus::Running => reading.progress.min(RUNNING_PROGRESS_CAP),
                    _ => 100.0,
                };
                match reading.status {
                    JobStatus::Completed => completed += 1,
                    JobStatus::Failed => failed += 1,
                    _ => {}
                }
            }
        }

        let status = if completed == individuals.len() {
            JobStatus::Completed
        } else if failed > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Running
        };
        Aggregate {
            progress: total / individuals.len() as f64,
            status,
        }
    }

    /// Rule (b) of association: the most recently opened master that is not
    /// terminal and whose hosts include `hostname`.
    pub fn find_master_for(&self, hostname: &str, registry: &JobRegistry) -> Option<String> {
        self.masters()
            .into_iter()
            .rev()
            .filter(|entry| entry.hosts.iter().any(|h| h == hostname))
            .find(|entry| {
                let registry_terminal = registry
                    .get(&entry.master_id)
                    .map_or(false, |job| job.status().is_terminal());
                let aggregate_terminal = !entry.individuals.is_empty()
                    && self.aggregate_progress(&entry.master_id).status.is_terminal();
                !registry_terminal && !aggregate_terminal
            })
            .map(|entry| entry.master_id.clone())
    }

    /// Drop what is known about a job that is no longer tracked. Readings of
    /// a master's individuals stay, they still count towards its aggregate.
    pub fn forget_job(&mut self, job_id: &str) {
        if self.owners.contains_key(job_id) {
            return;
        }
        self.readings.remove(job_id);
        self.recent.retain(|recent| recent.job_id != job_id);
        if self
            .masters
            .get(job_id)
            .map_or(false, |entry| entry.individuals.is_empty())
        {
            self.masters.remove(job_id);
        }
    }

    /// Drop everything known about a master and its individuals.
    pub fn forget_master(&mut self, master_id: &str) {
        if let Some(entry) = self.masters.remove(master_id) {
            for association in entry.individuals {
                self.owners.remove(&association.job_id);
                self.readings.remove(&association.job_id);
            }
        }
        self.readings.remove(master_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExtraVars, JobMetadata};

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_aggregate_of_completed_and_running() {
        let mut correlator = HostCorrelator::new();
        correlator.open_master("m", &hosts(&["h1", "h2"]));
        assert!(correlator.associate("m", "j1", "h1"));
        assert!(correlator.associate("m", "j2", "h2"));
        correlator.record("j1", JobStatus::Completed, Some(100.0));
        correlator.record("j2", JobStatus::Running, Some(40.0));

        let aggregate = correlator.aggregate_progress("m");
        assert_eq!(70.0, aggregate.progress);
        assert_eq!(JobStatus::Running, aggregate.status);

        correlator.record("j2", JobStatus::Completed, None);
        assert_eq!(
            Aggregate {
                progress: 100.0,
                status: JobStatus::Completed
            },
            correlator.aggregate_progress("m")
        );
    }

    #[test]
    fn test_failed_individual_fails_the_master() {
        let mut correlator = HostCorrelator::new();
        correlator.associate("m", "j1", "h1");
        correlator.associate("m", "j2", "h2");
        correlator.record("j1", JobStatus::Failed, None);
        correlator.record("j2", JobStatus::Running, Some(20.0));
        assert_eq!(JobStatus::Failed, correlator.aggregate_progress("m").status);
        assert_eq!(60.0, correlator.aggregate_progress("m").progress);
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut correlator = HostCorrelator::new();
        correlator.associate("m", "j1", "h1");
        assert_eq!(50.0, correlator.record("j1", JobStatus::Running, Some(50.0)));
        assert_eq!(50.0, correlator.record("j1", JobStatus::Running, Some(30.0)));
        assert_eq!(50.0, correlator.record("j1", JobStatus::Running, None));
        assert_eq!(60.0, correlator.record("j1", JobStatus::Running, Some(60.0)));
        assert_eq!(60.0, correlator.aggregate_progress("m").progress);

        // running readings are capped in the aggregate only
        correlator.record("j1", JobStatus::Running, Some(99.0));
        assert_eq!(90.0, correlator.aggregate_progress("m").progress);
    }

    #[test]
    fn test_associate_is_idempotent_and_exclusive() {
        let mut correlator = HostCorrelator::new();
        assert!(correlator.associate("m1", "j1", "h1"));
        assert!(correlator.associate("m1", "j1", "h1"));
        assert!(!correlator.associate("m2", "j1", "h1"));
        assert_eq!(1, correlator.master("m1").unwrap().individuals().len());
        assert_eq!(Some("m1"), correlator.master_of("j1"));
    }

    #[test]
    fn test_resolve_precedence() {
        let mut correlator = HostCorrelator::new();
        correlator.open_master("m", &hosts(&["h1", "h2", "h3"]));
        correlator.associate("m", "j1", "h1");
        correlator.note_individual("j1", "h1");
        correlator.note_individual("j2", "h2");
        correlator.note_individual("other", "h3");
        correlator.associate("elsewhere", "other", "h3");

        let resolved = correlator.resolve("m", &hosts(&["h1", "h2", "h3"]));
        let sources: Vec<(&str, ResolutionSource)> = resolved
            .iter()
            .map(|r| (r.job_id().as_str(), *r.source()))
            .collect();
        assert_eq!(
            vec![
                ("j1", ResolutionSource::Associated),
                ("j2", ResolutionSource::Recent),
                ("m", ResolutionSource::Master),
            ],
            sources
        );
    }

    #[test]
    fn test_resolve_falls_back_to_master() {
        let correlator = HostCorrelator::new();
        let resolved = correlator.resolve("master-1", &hosts(&["h1"]));
        assert_eq!(1, resolved.len());
        assert_eq!("master-1", resolved[0].job_id());
        assert_eq!("h1", resolved[0].hostname());
    }

    #[test]
    fn test_recent_history_is_bounded() {
        let mut correlator = HostCorrelator::new();
        correlator.note_individual("first", "h0");
        for i in 0..RECENT_JOBS_CAP {
            correlator.note_individual(&format!("j{i}"), &format!("h{}", i + 1));
        }
        let resolved = correlator.resolve("m", &hosts(&["h0"]));
        assert_eq!(ResolutionSource::Master, *resolved[0].source());
    }

    #[test]
    fn test_forget_job_keeps_what_a_master_still_needs() {
        let mut correlator = HostCorrelator::new();
        correlator.open_master("batch", &hosts(&["h1", "h2"]));
        correlator.record("batch", JobStatus::Running, Some(10.0));
        correlator.associate("m", "j1", "h1");
        correlator.record("j1", JobStatus::Cancelled, None);
        correlator.note_individual("solo", "h3");
        correlator.record("solo", JobStatus::Running, Some(5.0));

        correlator.forget_job("batch");
        correlator.forget_job("j1");
        correlator.forget_job("solo");

        assert!(correlator.master("batch").is_none());
        assert!(!correlator.readings.contains_key("batch"));
        assert!(!correlator.readings.contains_key("solo"));
        assert_eq!(
            ResolutionSource::Master,
            *correlator.resolve("x", &hosts(&["h3"]))[0].source()
        );
        assert_eq!(Some("m"), correlator.master_of("j1"));
        assert_eq!(100.0, correlator.aggregate_progress("m").progress);
    }

    #[test]
    fn test_find_master_for_prefers_latest_open_master() {
        let mut registry = JobRegistry::new();
        registry.register(
            "old",
            JobMetadata::new("a.yml", "/a.yml", hosts(&["h1", "h2"]), ExtraVars::new()),
        );
        registry.register(
            "new",
            JobMetadata::new("a.yml", "/a.yml", hosts(&["h1"]), ExtraVars::new()),
        );
        let mut correlator = HostCorrelator::new();
        correlator.open_master("old", &hosts(&["h1", "h2"]));
        correlator.open_master("new", &hosts(&["h1"]));

        assert_eq!(Some("new".to_string()), correlator.find_master_for("h1", &registry));
        assert_eq!(Some("old".to_string()), correlator.find_master_for("h2", &registry));

        registry.apply_status("new", JobStatus::Completed, None, None);
        assert_eq!(Some("old".to_string()), correlator.find_master_for("h1", &registry));
        assert_eq!(None, correlator.find_master_for("h9", &registry));
    }
}
