use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{flag, playbook_matches, HookError, PreSubmitHook};
use crate::ipc::RunRequest;

pub const ANTIVIRUS_KEYWORDS: [&str; 5] =
    ["antivirus", "antivírus", "trend", "trendmicro", "trend micro"];

pub const DEFAULT_SCRIPT: &str = "antivirus.ps1";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AntivirusConfig {
    #[serde(default = "default_script")]
    pub script_file: String,
    #[serde(default)]
    pub custom_script: bool,
    /// Body of a custom script. Only sent when `custom_script` is set.
    #[serde(default)]
    pub script_content: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

fn default_script() -> String {
    DEFAULT_SCRIPT.to_string()
}

impl Default for AntivirusConfig {
    fn default() -> Self {
        Self {
            script_file: default_script(),
            custom_script: false,
            script_content: None,
            verified: false,
        }
    }
}

/// Tells antivirus playbooks which installer script to run.
#[derive(Clone, Debug, Default)]
pub struct AntivirusHook {
    config: AntivirusConfig,
}

impl AntivirusHook {
    pub fn new(config: AntivirusConfig) -> Self {
        Self { config }
    }
}

impl PreSubmitHook for AntivirusHook {
    fn name(&self) -> &str {
        "antivirus"
    }

    fn applies_to(&self, playbook_name: &str) -> bool {
        playbook_matches(playbook_name, &ANTIVIRUS_KEYWORDS)
    }

    fn before_submit(&self, request: &mut RunRequest) -> Result<(), HookError> {
        let vars = &mut request.extra_vars;
        let filename = if self.config.script_file.is_empty() {
            DEFAULT_SCRIPT
        } else {
            self.config.script_file.as_str()
        };
        vars.insert("custom_script".to_string(), Value::Bool(self.config.custom_script));
        vars.insert(
            "script_filename".to_string(),
            Value::String(filename.to_string()),
        );
        vars.insert("verified".to_string(), flag(self.config.verified));
        if self.config.custom_script {
            if let Some(content) = &self.config.script_content {
                vars.insert("script_content".to_string(), Value::String(content.clone()));
            }
        }
        Ok(())
    }
}
