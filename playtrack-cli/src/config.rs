use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr};
use playtrack::hooks::{AntivirusConfig, DeviceGroup, Site24x7Config};
use playtrack::log::*;
use playtrack::tracker::TrackerConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const SERVER_ENV: &str = "PLAYTRACK_SERVER";

fn default_server() -> String {
    "http://127.0.0.1:5000".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Base URL of the runner.
    #[serde(default = "self::default_server")]
    pub server: String,
    #[serde(flatten)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub site24x7: Site24x7Config,
    #[serde(default)]
    pub antivirus: AntivirusConfig,
    #[serde(default)]
    pub device_groups: Vec<DeviceGroup>,
    /// Overrides `<data dir>/playtrack/store.json`.
    #[serde(default)]
    pub store: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            tracker: TrackerConfig::default(),
            site24x7: Site24x7Config::default(),
            antivirus: AntivirusConfig::default(),
            device_groups: vec![],
            store: None,
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "playtrack")
            .ok_or_else(|| eyre!("could not get project directories"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).wrap_err("deserializing config")
    }

    /// Read the config file. An explicitly given file must exist; a missing
    /// default file means defaults.
    #[tracing::instrument]
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let yaml = fs::read_to_string(path)
                    .await
                    .wrap_err_with(|| format!("reading config {}", path.display()))?;
                Self::from_yaml(&yaml)?
            }
            None => {
                let path = Self::default_path()?;
                match fs::read_to_string(&path).await {
                    Ok(yaml) => Self::from_yaml(&yaml)?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("no config at {}, using defaults", path.display());
                        Self::default()
                    }
                    Err(e) => {
                        return Err(e)
                            .wrap_err_with(|| format!("reading config {}", path.display()))
                    }
                }
            }
        };
        Ok(config.with_server(std::env::var(SERVER_ENV).ok()))
    }

    pub fn with_server(mut self, server: Option<String>) -> Self {
        if let Some(server) = server.filter(|s| !s.trim().is_empty()) {
            self.server = server;
        }
        self
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store {
            Some(path) => Ok(path.clone()),
            None => playtrack::store::LocalStore::default_path(),
        }
    }

    /// The Site24x7 settings with `device_key` resolved through the named
    /// device groups.
    pub fn site24x7(&self) -> Site24x7Config {
        match self.site24x7.device_key.as_deref() {
            Some(choice) => {
                Site24x7Config::with_group(&self.device_groups, choice, self.site24x7.verified)
            }
            None => self.site24x7.clone(),
        }
    }
}
