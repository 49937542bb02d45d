//! Small JSON key/value file for state that outlives a process: baseline
//! host configs and the jobs a session was watching.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::fs;

use crate::baseline::HostConfig;
use crate::log::*;
use crate::tracker::SessionSnapshot;

pub const HOST_CONFIGS_KEY: &str = "baseline_configs";
pub const SESSION_KEY: &str = "running_jobs";

#[derive(Clone, Debug)]
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/playtrack/store.json`.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "playtrack")
            .ok_or_else(|| eyre!("could not get project directories"))?;
        Ok(dirs.data_dir().join("store.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The whole file. A missing file is empty; an unreadable one is logged
    /// and treated as empty so a bad write never locks the user out.
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Map<String, Value>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("reading {}", self.path.display()))
            }
        };
        match serde_json::from_str::<Map<String, Value>>(&text) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!("discarding unreadable store: {e}");
                Ok(Map::new())
            }
        }
    }

    async fn write(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("creating {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(map)?)
            .await
            .wrap_err_with(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .wrap_err_with(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.load().await?.remove(key) {
            Some(value) => Ok(Some(
                serde_json::from_value(value).wrap_err_with(|| format!("decoding `{key}`"))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut map = self.load().await?;
        map.insert(key.to_string(), serde_json::to_value(value)?);
        self.write(&map).await
    }

    /// Returns whether the key was present.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut map = self.load().await?;
        let existed = map.remove(key).is_some();
        if existed {
            self.write(&map).await?;
        }
        Ok(existed)
    }

    pub async fn load_session(&self) -> Result<Option<SessionSnapshot>> {
        self.get(SESSION_KEY).await
    }

    pub async fn save_session(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.set(SESSION_KEY, snapshot).await
    }

    pub async fn clear_session(&self) -> Result<bool> {
        self.remove(SESSION_KEY).await
    }
}

/// Baseline configs keyed by hostname.
#[derive(Clone, Debug)]
pub struct HostConfigStore {
    store: LocalStore,
}

impl HostConfigStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn load_all(&self) -> Result<HashMap<String, HostConfig>> {
        Ok(self.store.get(HOST_CONFIGS_KEY).await?.unwrap_or_default())
    }

    pub async fn get(&self, host: &str) -> Result<Option<HostConfig>> {
        Ok(self.load_all().await?.remove(host))
    }

    /// Validates before writing, so only usable configs are ever stored.
    pub async fn save(&self, host: &str, config: HostConfig) -> Result<()> {
        config
            .validate()
            .wrap_err_with(|| format!("baseline config for {host}"))?;
        let mut all = self.load_all().await?;
        all.insert(host.to_string(), config);
        self.store.set(HOST_CONFIGS_KEY, &all).await
    }

    pub async fn remove(&self, host: &str) -> Result<bool> {
        let mut all = self.load_all().await?;
        if all.remove(host).is_none() {
            return Ok(false);
        }
        self.store.set(HOST_CONFIGS_KEY, &all).await?;
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::Rng;

    pub(crate) fn temp_store() -> LocalStore {
        let suffix: u64 = rand::thread_rng().gen();
        LocalStore::open(
            std::env::temp_dir()
                .join(format!("playtrack-test-{suffix}"))
                .join("store.json"),
        )
    }

    fn config() -> HostConfig {
        HostConfig {
            new_hostname: None,
            root_password: "rootroot".to_string(),
            partner_password: "partner1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() -> Result<()> {
        let store = temp_store();
        assert_eq!(None, store.get::<String>("nope").await?);
        assert!(!store.remove("nope").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_get_remove() -> Result<()> {
        let store = temp_store();
        store.set("a", &vec![1, 2, 3]).await?;
        store.set("b", &"two").await?;
        assert_eq!(Some(vec![1, 2, 3]), store.get::<Vec<u32>>("a").await?);
        assert!(store.remove("a").await?);
        assert_eq!(None, store.get::<Vec<u32>>("a").await?);
        assert_eq!(Some("two".to_string()), store.get::<String>("b").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_is_discarded() -> Result<()> {
        let store = temp_store();
        store.set("a", &1).await?;
        fs::write(store.path(), "{not json").await?;
        assert_eq!(None, store.get::<u32>("a").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_host_configs() -> Result<()> {
        let configs = HostConfigStore::new(temp_store());
        configs.save("web01", config()).await?;
        assert_eq!(Some(config()), configs.get("web01").await?);

        let short = HostConfig {
            partner_password: "short".to_string(),
            ..config()
        };
        assert!(configs.save("db01", short).await.is_err());
        assert_eq!(1, configs.load_all().await?.len());

        assert!(configs.remove("web01").await?);
        assert!(!configs.remove("web01").await?);
        Ok(())
    }
}
