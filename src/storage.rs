//! Best-effort persistence of the last requested rate.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use parking_lot::Mutex;

pub const LAST_RATE_KEY: &str = "ratelock_lastRate";

pub trait RateStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<f64>>;
    fn save(&self, rate: f64) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    value: Mutex<Option<f64>>,
}

impl MemoryStore {
    pub fn with_rate(rate: f64) -> Self {
        Self {
            value: Mutex::new(Some(rate)),
        }
    }
}

impl RateStore for MemoryStore {
    fn load(&self) -> anyhow::Result<Option<f64>> {
        Ok(*self.value.lock())
    }

    fn save(&self, rate: f64) -> anyhow::Result<()> {
        *self.value.lock() = Some(rate);
        Ok(())
    }
}

/// A JSON object of string values on disk, one key per setting.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_entries(&self) -> anyhow::Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(&self.path).context("Failed to read rate store")?;
        let entries = serde_json::from_str(&contents).context("Failed to parse rate store")?;
        Ok(entries)
    }
}

impl RateStore for FileStore {
    fn load(&self) -> anyhow::Result<Option<f64>> {
        let entries = self.read_entries()?;
        let Some(value) = entries.get(LAST_RATE_KEY) else {
            return Ok(None);
        };
        let rate = value
            .parse()
            .with_context(|| format!("Stored rate '{value}' is not a number"))?;
        Ok(Some(rate))
    }

    fn save(&self, rate: f64) -> anyhow::Result<()> {
        let mut entries = self.read_entries().unwrap_or_else(|err| {
            log::warn!("Discarding unreadable rate store: {err:?}");
            HashMap::new()
        });
        entries.insert(LAST_RATE_KEY.to_string(), rate.to_string());
        let contents = serde_json::to_string_pretty(&entries)?;
        fs::write(&self.path, contents).context("Failed to write rate store")?;
        Ok(())
    }
}
