//! Loader for pretrained Demucs denoising models.
//!
//! A model comes either from a local package carrying its own architecture or
//! from one of the published variants, whose weights are fetched through a
//! [`store::WeightStore`] and loaded strictly into the variant's fixed
//! architecture.

pub mod cli;
pub mod config;
pub mod error;
pub mod loader;
pub mod model;
pub mod store;

pub use config::LoaderConfig;
pub use error::{Error, Result};
pub use loader::{ModelLoader, ModelSelection};
pub use model::{Demucs, DemucsConfig, ModelPackage, Variant};
pub use store::{HttpWeightStore, WeightSource, WeightStore};
