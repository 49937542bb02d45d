//! Hooks that adjust a job's payload before it is sent to the runner.
//!
//! Each hook declares which playbooks it cares about and gets mutable access
//! to the [`RunRequest`] for those. A hook returning an error blocks the
//! submission.

use serde_json::Value;
use thiserror::Error;

use crate::baseline::ValidationError;
use crate::ipc::RunRequest;
use crate::log::*;

pub mod antivirus;
pub mod site24x7;

pub use antivirus::{AntivirusConfig, AntivirusHook};
pub use site24x7::{DeviceGroup, Site24x7Config, Site24x7Hook};

#[derive(Error, Debug)]
pub enum HookError {
    #[error("{0} hook rejected the submission: {1}")]
    Validation(String, #[source] ValidationError),
}

pub trait PreSubmitHook: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, playbook_name: &str) -> bool;

    fn before_submit(&self, request: &mut RunRequest) -> Result<(), HookError>;
}

/// Hooks in registration order.
#[derive(Debug, Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn PreSubmitHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: PreSubmitHook + 'static>(&mut self, hook: H) -> &mut Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|hook| hook.name()).collect()
    }

    /// Whether any registered hook wants to see `playbook_name`.
    pub fn applies_to(&self, playbook_name: &str) -> bool {
        self.hooks.iter().any(|hook| hook.applies_to(playbook_name))
    }

    #[tracing::instrument(skip(self, request), fields(hosts = ?request.hosts))]
    pub fn run(&self, playbook_name: &str, request: &mut RunRequest) -> Result<(), HookError> {
        for hook in self.hooks.iter().filter(|hook| hook.applies_to(playbook_name)) {
            debug!("running {} hook", hook.name());
            hook.before_submit(request)?;
        }
        Ok(())
    }
}

/// Whether the playbook's file name contains any of `keywords`, ignoring
/// case. Directories in `playbook_name` are not considered.
pub fn playbook_matches(playbook_name: &str, keywords: &[&str]) -> bool {
    let base = playbook_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(playbook_name)
        .to_lowercase();
    keywords
        .iter()
        .any(|keyword| base.contains(&keyword.to_lowercase()))
}

pub(crate) fn flag(value: bool) -> Value {
    Value::String(if value { "true" } else { "false" }.to_string())
}
