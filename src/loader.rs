use crate::cli::ModelFlags;
use crate::config::LoaderConfig;
use crate::error::Result;
use crate::model::{Demucs, ModelPackage, Variant};
use crate::store::{HttpWeightStore, WeightSource, WeightStore};
use candle_core::Device;
use std::fmt;
use std::path::{Path, PathBuf};

/// What the caller asked for. No selection at all means [`Variant::DEFAULT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSelection {
    Path(PathBuf),
    Variant(Variant),
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSelection::Path(path) => write!(f, "{}", path.display()),
            ModelSelection::Variant(variant) => write!(f, "{}", variant),
        }
    }
}

/// Produces ready-to-run models from a local package or a pretrained variant.
pub struct ModelLoader<S = HttpWeightStore> {
    config: LoaderConfig,
    store: S,
    device: Device,
}

impl ModelLoader<HttpWeightStore> {
    pub fn new(config: LoaderConfig, device: Device) -> Result<Self> {
        let store = HttpWeightStore::new(config.clone())?;
        Ok(Self::with_store(config, store, device))
    }
}

impl<S: WeightStore> ModelLoader<S> {
    pub fn with_store(config: LoaderConfig, store: S, device: Device) -> Self {
        Self {
            config,
            store,
            device,
        }
    }

    pub fn resolve(&self, selection: Option<&ModelSelection>) -> Result<Demucs> {
        let model = match selection {
            Some(ModelSelection::Path(path)) => self.load_package(path)?,
            Some(ModelSelection::Variant(variant)) => self.load_variant(*variant)?,
            None => self.load_variant(Variant::DEFAULT)?,
        };
        tracing::debug!("{:?}", model);
        Ok(model)
    }

    /// Validates the flag group before touching disk or network.
    pub fn resolve_flags(&self, flags: &ModelFlags) -> Result<Demucs> {
        let selection = flags.selection()?;
        self.resolve(selection.as_ref())
    }

    /// Loads a package that carries its own architecture.
    pub fn load_package(&self, path: &Path) -> Result<Demucs> {
        tracing::info!("Loading model from {}", path.display());

        let package = ModelPackage::read(path, &self.device)?;
        tracing::debug!("Package layout: {}", package.layout());

        let descriptor = package.into_descriptor()?;
        Demucs::from_descriptor(descriptor, &self.device)
    }

    /// Builds the variant's fixed architecture and fills it with its
    /// published weights.
    pub fn load_variant(&self, variant: Variant) -> Result<Demucs> {
        tracing::info!("Loading {}.", variant.description());

        let mut model = Demucs::new(variant.config(), &self.device)?;

        let source = variant.source(&self.config);
        if let WeightSource::Local { path } = &source {
            tracing::info!("Using local weights for {} from {}", variant, path.display());
        }
        let weights_path = self.store.fetch(&source)?;

        let state = match ModelPackage::read(&weights_path, &self.device)? {
            ModelPackage::RawWeights(state) => state,
            package => package.into_descriptor()?.state,
        };
        model.load_state_dict(state)?;

        Ok(model)
    }
}
