//! Per-host baseline configuration: the new hostname and the credentials a
//! baseline playbook sets on the machine.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hooks::{playbook_matches, HookError, PreSubmitHook};
use crate::ipc::RunRequest;
use crate::log::*;

pub const BASELINE_KEYWORDS: [&str; 3] = ["baseline", "configuracao-base", "configuração-base"];

pub const MIN_PASSWORD_LEN: usize = 8;
pub const DEFAULT_PASSWORD_LEN: usize = 12;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()_-+=<>?";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no baseline configuration for host `{0}`")]
    MissingConfig(String),
    #[error("{0} password is missing")]
    MissingPassword(&'static str),
    #[error("{0} password must have at least 8 characters, got {1}")]
    PasswordTooShort(&'static str, usize),
    #[error("baseline runs against exactly one host per job, got {0}")]
    HostCount(usize),
}

/// What a baseline run applies to one host.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    /// Rename target. The current hostname is kept when unset.
    #[serde(default)]
    pub new_hostname: Option<String>,
    #[serde(default)]
    pub root_password: String,
    #[serde(default)]
    pub partner_password: String,
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_password("partner", &self.partner_password)?;
        check_password("root", &self.root_password)?;
        Ok(())
    }

    pub fn hostname_for<'a>(&'a self, host: &'a str) -> &'a str {
        self.new_hostname
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(host)
    }

    /// A config with freshly generated passwords.
    pub fn generated(new_hostname: Option<String>) -> Self {
        Self {
            new_hostname,
            root_password: generate_password(DEFAULT_PASSWORD_LEN),
            partner_password: generate_password(DEFAULT_PASSWORD_LEN),
        }
    }
}

fn check_password(which: &'static str, password: &str) -> Result<(), ValidationError> {
    let len = password.chars().count();
    if len == 0 {
        Err(ValidationError::MissingPassword(which))
    } else if len < MIN_PASSWORD_LEN {
        Err(ValidationError::PasswordTooShort(which, len))
    } else {
        Ok(())
    }
}

/// A random password of `len` characters (at least 4) with at least one
/// uppercase letter, lowercase letter, digit and symbol.
pub fn generate_password(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let classes = [UPPER, LOWER, DIGITS, SYMBOLS];
    let mut chars: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.gen_range(0..class.len())])
        .collect();
    let all: Vec<u8> = classes.concat();
    while chars.len() < len {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);
    chars.into_iter().map(char::from).collect()
}

/// Fills a baseline job's extra vars from the stored config of its host.
#[derive(Clone, Debug, Default)]
pub struct BaselineHook {
    configs: HashMap<String, HostConfig>,
}

impl BaselineHook {
    pub fn new(configs: HashMap<String, HostConfig>) -> Self {
        Self { configs }
    }

    pub fn is_baseline(playbook_name: &str) -> bool {
        playbook_matches(playbook_name, &BASELINE_KEYWORDS)
    }

    fn apply(&self, request: &mut RunRequest) -> Result<(), ValidationError> {
        let [host] = request.hosts.as_slice() else {
            return Err(ValidationError::HostCount(request.hosts.len()));
        };
        let config = self
            .configs
            .get(host)
            .ok_or_else(|| ValidationError::MissingConfig(host.clone()))?;
        config.validate()?;

        let new_hostname = config.hostname_for(host).to_string();
        debug!("baseline for {host} renames it to {new_hostname}");
        let vars = [
            ("new_hostname", new_hostname),
            ("parceiro_password", config.partner_password.clone()),
            ("root_password", config.root_password.clone()),
            ("user_password", config.partner_password.clone()),
            ("admin_password", config.root_password.clone()),
        ];
        for (key, value) in vars {
            request
                .extra_vars
                .insert(key.to_string(), Value::String(value));
        }
        Ok(())
    }
}

impl PreSubmitHook for BaselineHook {
    fn name(&self) -> &str {
        "baseline"
    }

    fn applies_to(&self, playbook_name: &str) -> bool {
        Self::is_baseline(playbook_name)
    }

    fn before_submit(&self, request: &mut RunRequest) -> Result<(), HookError> {
        self.apply(request)
            .map_err(|e| HookError::Validation(self.name().to_string(), e))
    }
}
