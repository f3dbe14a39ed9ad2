pub mod demucs;
pub mod package;
mod pytorch;
pub mod variant;

pub use demucs::{Demucs, DemucsConfig, ModelSummary, StateDict};
pub use package::{ModelDescriptor, ModelPackage};
pub use variant::{ArchitectureOverrides, Variant};
