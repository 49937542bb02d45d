//! Host metadata shown next to execution output.

use crate::ipc::{HostFacts, RunnerApi};
use crate::log::*;

impl HostFacts {
    /// Facts for a host nothing is known about.
    pub fn placeholder<S: Into<String>>(hostname: S) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..Self::default()
        }
    }
}

/// Look up display metadata for a host. Never fails: when the per-host
/// endpoint is missing the full host list is consulted, and when that fails
/// too a placeholder carrying only the hostname is returned.
#[tracing::instrument(skip(api))]
pub async fn host_details(api: &dyn RunnerApi, hostname: &str) -> HostFacts {
    match api.host(hostname).await {
        Ok(Some(facts)) => return with_hostname(facts, hostname),
        Ok(None) => debug!("no per-host endpoint for {hostname}, using host list"),
        Err(e) => warn!("fetching facts for {hostname} failed: {e}"),
    }

    match api.hosts().await {
        Ok(mut hosts) => match hosts.remove(hostname).and_then(|entry| entry.facts) {
            Some(facts) => with_hostname(facts, hostname),
            None => {
                debug!("host list has no facts for {hostname}");
                HostFacts::placeholder(hostname)
            }
        },
        Err(e) => {
            warn!("fetching host list failed: {e}");
            HostFacts::placeholder(hostname)
        }
    }
}

fn with_hostname(mut facts: HostFacts, hostname: &str) -> HostFacts {
    if facts.hostname.as_deref().map_or(true, str::is_empty) {
        facts.hostname = Some(hostname.to_string());
    }
    facts
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::ipc::{ApiError, HostEntry, PlaybookEntry, RunRequest, StatusResponse};

    #[derive(Debug)]
    struct HostsOnly {
        per_host: Result<Option<HostFacts>, u16>,
        list: Result<HashMap<String, HostEntry>, u16>,
    }

    fn err(code: u16) -> ApiError {
        ApiError::Status("fake".into(), code, String::new())
    }

    #[async_trait]
    impl RunnerApi for HostsOnly {
        async fn run(&self, _request: &RunRequest) -> Result<String, ApiError> {
            Err(err(501))
        }
        async fn status(&self, _job_id: &str) -> Result<StatusResponse, ApiError> {
            Err(err(501))
        }
        async fn cancel(&self, _job_id: &str) -> Result<(), ApiError> {
            Err(err(501))
        }
        async fn playbooks(&self) -> Result<Vec<PlaybookEntry>, ApiError> {
            Err(err(501))
        }
        async fn hosts(&self) -> Result<HashMap<String, HostEntry>, ApiError> {
            self.list.clone().map_err(err)
        }
        async fn host(&self, _hostname: &str) -> Result<Option<HostFacts>, ApiError> {
            self.per_host.clone().map_err(err)
        }
    }

    fn facts(ip: &str) -> HostFacts {
        HostFacts {
            hostname: None,
            public_ip: Some(ip.into()),
            private_ip: None,
            system: Some("Debian 12".into()),
        }
    }

    #[tokio::test]
    async fn test_per_host_endpoint_is_preferred() {
        let api = HostsOnly {
            per_host: Ok(Some(facts("1.1.1.1"))),
            list: Err(500),
        };
        let found = host_details(&api, "web01").await;
        assert_eq!(Some("1.1.1.1".to_string()), found.public_ip);
        assert_eq!(Some("web01".to_string()), found.hostname);
    }

    #[tokio::test]
    async fn test_falls_back_to_host_list() {
        let mut list = HashMap::new();
        list.insert(
            "web01".to_string(),
            HostEntry {
                facts: Some(facts("2.2.2.2")),
            },
        );
        let api = HostsOnly {
            per_host: Ok(None),
            list: Ok(list),
        };
        assert_eq!(Some("2.2.2.2".to_string()), host_details(&api, "web01").await.public_ip);
    }

    #[tokio::test]
    async fn test_everything_failing_yields_placeholder() {
        let api = HostsOnly {
            per_host: Err(502),
            list: Err(502),
        };
        assert_eq!(HostFacts::placeholder("db01"), host_details(&api, "db01").await);
    }
}
