use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_REMOTE_ROOT: &str = "https://dl.fbaipublicfiles.com/adiyoss/denoiser/";

/// Everything the loader needs to know about its surroundings. Built once at
/// the CLI boundary; the library itself never reads the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
	pub cache_dir: PathBuf,
	pub checkpoints_dir: PathBuf,
	pub index_path: PathBuf,
	/// Serve the dns48 weights from this file instead of the remote archive.
	pub dns48_override: Option<PathBuf>,
	pub check_hash: bool,
	pub remote_root: String,
}

impl LoaderConfig {
	pub fn new() -> crate::error::Result<Self> {
		let project_dirs = ProjectDirs::from("", "", "denoiser").ok_or_else(|| {
			crate::error::Error::Configuration("Could not determine cache directory".to_string())
		})?;

		Self::with_cache_dir(project_dirs.cache_dir())
	}

	pub fn with_cache_dir(cache_dir: impl AsRef<Path>) -> crate::error::Result<Self> {
		let cache_dir = cache_dir.as_ref().to_path_buf();
		let checkpoints_dir = cache_dir.join("checkpoints");
		let index_path = cache_dir.join("index.toml");

		std::fs::create_dir_all(&cache_dir)?;
		std::fs::create_dir_all(&checkpoints_dir)?;

		Ok(Self {
			cache_dir,
			checkpoints_dir,
			index_path,
			dns48_override: None,
			check_hash: false,
			remote_root: DEFAULT_REMOTE_ROOT.to_string(),
		})
	}

	pub fn dns48_override(mut self, path: Option<PathBuf>) -> Self {
		self.dns48_override = path;
		self
	}

	pub fn check_hash(mut self, check_hash: bool) -> Self {
		self.check_hash = check_hash;
		self
	}

	pub fn remote_root(mut self, root: impl Into<String>) -> Self {
		let mut root = root.into();
		if !root.ends_with('/') {
			root.push('/');
		}
		self.remote_root = root;
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cache_dir_layout_is_created() {
		let dir = tempfile::tempdir().unwrap();
		let config = LoaderConfig::with_cache_dir(dir.path().join("cache")).unwrap();

		assert!(config.checkpoints_dir.is_dir());
		assert_eq!(config.index_path, dir.path().join("cache").join("index.toml"));
		assert_eq!(config.remote_root, DEFAULT_REMOTE_ROOT);
		assert!(config.dns48_override.is_none());
		assert!(!config.check_hash);
	}

	#[test]
	fn remote_root_gets_trailing_slash() {
		let dir = tempfile::tempdir().unwrap();
		let config = LoaderConfig::with_cache_dir(dir.path())
			.unwrap()
			.remote_root("http://localhost:9000/weights");
		assert_eq!(config.remote_root, "http://localhost:9000/weights/");
	}
}
