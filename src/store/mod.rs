pub mod http;
pub mod index;

pub use http::HttpWeightStore;
pub use index::{CacheEntry, CacheIndex};

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    Remote { url: String },
    Local { path: PathBuf },
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightSource::Remote { url } => write!(f, "{}", url),
            WeightSource::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Turns a weight source into a readable local file.
pub trait WeightStore {
    fn fetch(&self, source: &WeightSource) -> Result<PathBuf>;
}

impl<S: WeightStore + ?Sized> WeightStore for &S {
    fn fetch(&self, source: &WeightSource) -> Result<PathBuf> {
        (**self).fetch(source)
    }
}

/// Local sources need no store: they only have to exist.
pub(crate) fn resolve_local(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(Error::NotFound(format!(
            "Weight file does not exist: {}",
            path.display()
        )))
    }
}

/// The hex digest prefix embedded in names like `dns48-11decc9d8e3f0998.th`.
pub fn hash_prefix(file_name: &str) -> Option<&str> {
    let stem = file_name.split_once('.').map(|(stem, _)| stem)?;
    let (_, prefix) = stem.rsplit_once('-')?;
    let is_hex = prefix
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    (!prefix.is_empty() && is_hex).then_some(prefix)
}
