use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::store::{hash_prefix, resolve_local, CacheEntry, CacheIndex, WeightSource, WeightStore};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Downloads remote weights once and serves them from the cache afterwards.
pub struct HttpWeightStore {
    config: LoaderConfig,
    client: Client,
}

impl HttpWeightStore {
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(3600))
            .user_agent(concat!("denoiser/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn cache_path(&self, url: &str) -> Result<PathBuf> {
        Ok(self.config.checkpoints_dir.join(file_name(url)?))
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.cache_path(url).map(|p| p.exists()).unwrap_or(false)
    }

    fn download(&self, url: &str) -> Result<PathBuf> {
        let file_name = file_name(url)?;
        let dest = self.config.checkpoints_dir.join(file_name);

        if dest.exists() {
            tracing::debug!("Using cached weights {:?}", dest);
            return Ok(dest);
        }

        tracing::info!("Downloading {} to {:?}", url, dest);

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::NotFound(format!("Could not reach {}: {}", url, e)))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::NotFound(format!("No weights at {}", url)));
            }
            status => {
                return Err(Error::NotFound(format!("HTTP {} for {}", status, url)));
            }
        }

        let bytes = response
            .bytes()
            .map_err(|e| Error::NotFound(format!("Failed to read response from {}: {}", url, e)))?;
        let digest = format!("{:x}", Sha256::digest(&bytes));

        if self.config.check_hash {
            verify_digest(file_name, &digest)?;
        }

        store_atomically(&dest, &bytes)?;

        tracing::debug!("Downloaded {} bytes to {:?}", bytes.len(), dest);

        self.record(CacheEntry {
            file_name: file_name.to_string(),
            url: url.to_string(),
            path: dest.clone(),
            sha256: digest,
            size_bytes: bytes.len() as u64,
            fetched_at: chrono::Utc::now().to_rfc3339(),
        });

        Ok(dest)
    }

    fn record(&self, entry: CacheEntry) {
        let result = CacheIndex::load(&self.config).and_then(|mut index| {
            index.record(entry);
            index.save(&self.config)
        });
        if let Err(e) = result {
            tracing::warn!("Could not update cache index: {}", e);
        }
    }
}

impl WeightStore for HttpWeightStore {
    fn fetch(&self, source: &WeightSource) -> Result<PathBuf> {
        match source {
            WeightSource::Local { path } => resolve_local(path),
            WeightSource::Remote { url } => self.download(url),
        }
    }
}

fn file_name(url: &str) -> Result<&str> {
    url.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::Configuration(format!("URL has no file name: {}", url)))
}

/// `<file>.partial` next to the destination.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Writes to the partial file, then renames it into place. Nothing is left
/// behind under either name when a step fails.
fn store_atomically(dest: &Path, bytes: &[u8]) -> Result<()> {
    let partial = partial_path(dest);
    let result = fs::write(&partial, bytes).and_then(|_| fs::rename(&partial, dest));
    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&partial) {
            tracing::debug!("Could not remove {:?}: {}", partial, cleanup);
        }
        return Err(e.into());
    }
    Ok(())
}

fn verify_digest(file_name: &str, digest: &str) -> Result<()> {
    match hash_prefix(file_name) {
        Some(prefix) if digest.starts_with(prefix) => Ok(()),
        Some(prefix) => Err(Error::Deserialization(format!(
            "Hash mismatch for {}: expected prefix {}, got {}",
            file_name, prefix, digest
        ))),
        None => {
            tracing::warn!("No hash prefix in {}, skipping verification", file_name);
            Ok(())
        }
    }
}
