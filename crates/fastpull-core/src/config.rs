use std::{collections::HashMap, env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};
use fastpull_blos::{normalize_algorithms, HashAlgorithm};

use crate::spider::{DEFAULT_DOWNLOAD_SLOTS, DEFAULT_HTTP_TIMEOUT};

pub const ENV_PATH: &str = "FASTPULL_PATH";
pub const ENV_TEMP_PATH: &str = "FASTPULL_TEMP_PATH";
pub const ENV_HASHES: &str = "FASTPULL_HASHES";
pub const ENV_DOWNLOAD_SLOTS: &str = "FASTPULL_DOWNLOAD_SLOTS";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "FASTPULL_HTTP_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    /// Non-empty value of `key`.
    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Where the cache lives and how downloads behave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastpullConfig {
    pub base_path: PathBuf,
    temp_override: Option<PathBuf>,
    /// Digest algorithms recorded for every blob; always contains sha512.
    pub hashes: Vec<HashAlgorithm>,
    pub download_slots: usize,
    pub http_timeout: Duration,
}

impl FastpullConfig {
    /// Defaults rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            temp_override: None,
            hashes: normalize_algorithms(&[]),
            download_slots: DEFAULT_DOWNLOAD_SLOTS,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Builds a configuration from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a variable is malformed or no cache directory can be
    /// resolved.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> anyhow::Result<Self> {
        let base_path = match snapshot.var(ENV_PATH) {
            Some(path) => PathBuf::from(path),
            None => default_base_path()?,
        };
        let mut config = Self::new(base_path);
        config.temp_override = snapshot.var(ENV_TEMP_PATH).map(PathBuf::from);
        if let Some(raw) = snapshot.var(ENV_HASHES) {
            config.hashes = parse_hashes(raw).with_context(|| format!("invalid {ENV_HASHES}"))?;
        }
        if let Some(raw) = snapshot.var(ENV_DOWNLOAD_SLOTS) {
            let slots: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_DOWNLOAD_SLOTS} value '{raw}'"))?;
            if slots == 0 {
                return Err(anyhow!("{ENV_DOWNLOAD_SLOTS} must be at least 1"));
            }
            config.download_slots = slots;
        }
        if let Some(raw) = snapshot.var(ENV_HTTP_TIMEOUT_SECS) {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_HTTP_TIMEOUT_SECS} value '{raw}'"))?;
            config.http_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Move the cache root. An explicit temp path is kept; the default one
    /// follows the new root.
    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    #[must_use]
    pub fn with_temp_path(mut self, temp_path: impl Into<PathBuf>) -> Self {
        self.temp_override = Some(temp_path.into());
        self
    }

    #[must_use]
    pub fn with_hashes(mut self, hashes: &[HashAlgorithm]) -> Self {
        self.hashes = normalize_algorithms(hashes);
        self
    }

    /// Directory for in-progress downloads.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        self.temp_override
            .clone()
            .unwrap_or_else(|| self.base_path.join("tmp").join("spider"))
    }

    #[must_use]
    pub fn blos_path(&self) -> PathBuf {
        self.base_path.join("blos")
    }

    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        self.base_path.join("records")
    }
}

fn default_base_path() -> anyhow::Result<PathBuf> {
    dirs_next::cache_dir()
        .or_else(|| dirs_next::home_dir().map(|home| home.join(".cache")))
        .map(|dir| dir.join("fastpull"))
        .ok_or_else(|| anyhow!("unable to determine a cache directory; set {ENV_PATH}"))
}

fn parse_hashes(raw: &str) -> anyhow::Result<Vec<HashAlgorithm>> {
    let mut algorithms = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        algorithms.push(
            HashAlgorithm::from_str(name)
                .map_err(|_| anyhow!("unsupported hash algorithm '{name}'"))?,
        );
    }
    Ok(normalize_algorithms(&algorithms))
}
