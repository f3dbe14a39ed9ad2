use crate::config::LoaderConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub file_name: String,
    pub url: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub fetched_at: String,
}

/// Record of every weight file fetched into the cache, keyed by file name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
}

impl CacheIndex {
    pub fn load(config: &LoaderConfig) -> Result<Self> {
        if !config.index_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config.index_path)?;
        let index: CacheIndex = toml::from_str(&content)?;
        Ok(index)
    }

    pub fn save(&self, config: &LoaderConfig) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(&config.index_path, content)?;
        Ok(())
    }

    pub fn record(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.file_name.clone(), entry);
    }

    pub fn get(&self, file_name: &str) -> Option<&CacheEntry> {
        self.entries.get(file_name)
    }

    pub fn list(&self) -> Vec<&CacheEntry> {
        let mut entries: Vec<&CacheEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        entries
    }
}
