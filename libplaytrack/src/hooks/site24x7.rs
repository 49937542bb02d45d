use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{flag, playbook_matches, HookError, PreSubmitHook};
use crate::ipc::RunRequest;
use crate::log::*;

pub const SITE24X7_KEYWORDS: [&str; 3] = ["site24x7", "24x7", "site 24x7"];

/// A named Site24x7 device group, so users can pick a key by name.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceGroup {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Site24x7Config {
    #[serde(default)]
    pub device_key: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

impl Site24x7Config {
    /// Select a key by group name or id, falling back to treating `choice`
    /// as a raw device key.
    pub fn with_group(groups: &[DeviceGroup], choice: &str, verified: bool) -> Self {
        let key = groups
            .iter()
            .find(|group| group.name == choice || group.id.as_deref() == Some(choice))
            .map(|group| group.key.clone())
            .unwrap_or_else(|| choice.to_string());
        Self {
            device_key: Some(key),
            verified,
        }
    }
}

/// Injects the monitoring agent's device key into Site24x7 playbooks.
#[derive(Clone, Debug, Default)]
pub struct Site24x7Hook {
    config: Site24x7Config,
}

impl Site24x7Hook {
    pub fn new(config: Site24x7Config) -> Self {
        Self { config }
    }
}

impl PreSubmitHook for Site24x7Hook {
    fn name(&self) -> &str {
        "site24x7"
    }

    fn applies_to(&self, playbook_name: &str) -> bool {
        playbook_matches(playbook_name, &SITE24X7_KEYWORDS)
    }

    fn before_submit(&self, request: &mut RunRequest) -> Result<(), HookError> {
        let Some(key) = self.config.device_key.as_deref().filter(|k| !k.is_empty()) else {
            warn!("no Site24x7 device key configured, submitting {} unchanged", request.playbook);
            return Ok(());
        };
        request
            .extra_vars
            .insert("site24x7_api_key".to_string(), Value::String(key.to_string()));
        request
            .extra_vars
            .insert("verified".to_string(), flag(self.config.verified));
        Ok(())
    }
}
