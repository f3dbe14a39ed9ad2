//! Persisted model packages.
//!
//! Two on-disk formats are read. PyTorch zip archives (published checkpoints
//! and training packages) are walked by the pickle reader. Safetensors
//! files name their layout in the header metadata and prefix tensor names to
//! match it; this is also the format [`ModelPackage::save`] writes.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::{serialize_to_file, Dtype, TensorView};
use safetensors::SafeTensors;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::demucs::StateDict;
use crate::model::pytorch;

const FORMAT_KEY: &str = "format";
const FORMAT_NAME: &str = "denoiser.package";
const LAYOUT_KEY: &str = "layout";
const CLASS_KEY: &str = "class";
const ARGS_KEY: &str = "args";
const KWARGS_KEY: &str = "kwargs";
const HAS_BEST_KEY: &str = "has_best_state";

const DESCRIPTOR_LAYOUT: &str = "descriptor";
const STRUCTURED_LAYOUT: &str = "structured";

const DESCRIPTOR_PREFIX: &str = "state.";
const MODEL_PREFIX: &str = "model.state.";
const BEST_PREFIX: &str = "best_state.";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Everything needed to rebuild a model: which class, how to construct it,
/// and its weights.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub class: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub state: StateDict,
}

#[derive(Debug, Clone)]
pub enum ModelPackage {
    /// A bare weight mapping with no architecture attached.
    RawWeights(StateDict),
    /// The whole package is the descriptor.
    Descriptor(ModelDescriptor),
    /// Envelope around a descriptor, optionally with the best snapshot seen
    /// during training.
    Structured {
        model: ModelDescriptor,
        best_state: Option<StateDict>,
    },
}

impl ModelPackage {
    pub fn read(path: &Path, device: &Device) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "Model package does not exist: {}",
                path.display()
            )));
        }

        let mut magic = Vec::with_capacity(ZIP_MAGIC.len());
        File::open(path)?
            .take(ZIP_MAGIC.len() as u64)
            .read_to_end(&mut magic)?;
        if magic == ZIP_MAGIC {
            tracing::debug!("Reading PyTorch checkpoint {:?}", path);
            return pytorch::read_package(path, device);
        }

        tracing::debug!("Reading safetensors package {:?}", path);
        read_safetensors(&fs::read(path)?, device)
    }

    /// Collapses the package into the descriptor to deserialize. A best
    /// snapshot always replaces the descriptor's own state.
    pub fn into_descriptor(self) -> Result<ModelDescriptor> {
        match self {
            ModelPackage::Structured {
                mut model,
                best_state,
            } => {
                if let Some(best_state) = best_state {
                    tracing::debug!("Using best_state snapshot ({} tensors)", best_state.len());
                    model.state = best_state;
                }
                Ok(model)
            }
            ModelPackage::Descriptor(descriptor) => Ok(descriptor),
            ModelPackage::RawWeights(_) => Err(Error::Deserialization(
                "Package holds raw weights without an architecture descriptor".to_string(),
            )),
        }
    }

    pub fn layout(&self) -> &'static str {
        match self {
            ModelPackage::RawWeights(_) => "raw",
            ModelPackage::Descriptor(_) => DESCRIPTOR_LAYOUT,
            ModelPackage::Structured { .. } => STRUCTURED_LAYOUT,
        }
    }

    /// Writes the package as safetensors with layout metadata.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut metadata = HashMap::new();
        let mut tensors: Vec<(String, &Tensor)> = Vec::new();

        match self {
            ModelPackage::RawWeights(state) => {
                tensors.extend(state.iter().map(|(name, t)| (name.clone(), t)));
            }
            ModelPackage::Descriptor(descriptor) => {
                metadata.insert(FORMAT_KEY.to_string(), FORMAT_NAME.to_string());
                metadata.insert(LAYOUT_KEY.to_string(), DESCRIPTOR_LAYOUT.to_string());
                insert_descriptor_metadata(&mut metadata, descriptor)?;
                tensors.extend(prefixed(DESCRIPTOR_PREFIX, &descriptor.state));
            }
            ModelPackage::Structured { model, best_state } => {
                metadata.insert(FORMAT_KEY.to_string(), FORMAT_NAME.to_string());
                metadata.insert(LAYOUT_KEY.to_string(), STRUCTURED_LAYOUT.to_string());
                metadata.insert(HAS_BEST_KEY.to_string(), best_state.is_some().to_string());
                insert_descriptor_metadata(&mut metadata, model)?;
                tensors.extend(prefixed(MODEL_PREFIX, &model.state));
                if let Some(best_state) = best_state {
                    tensors.extend(prefixed(BEST_PREFIX, best_state));
                }
            }
        }

        let mut owned = Vec::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            let values = tensor
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(|e| Error::Serialization(format!("Failed to read {}: {}", name, e)))?;
            let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            owned.push((name, tensor.dims().to_vec(), data));
        }

        let mut views = BTreeMap::new();
        for (name, shape, data) in &owned {
            let view = TensorView::new(Dtype::F32, shape.clone(), data)
                .map_err(|e| Error::Serialization(format!("Failed to build {}: {}", name, e)))?;
            views.insert(name.clone(), view);
        }

        let metadata = if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        };
        serialize_to_file(views, &metadata, path)
            .map_err(|e| Error::Serialization(format!("Failed to write package: {}", e)))?;

        tracing::debug!("Wrote {} package to {:?}", self.layout(), path);
        Ok(())
    }
}

fn prefixed<'a>(
    prefix: &'a str,
    state: &'a StateDict,
) -> impl Iterator<Item = (String, &'a Tensor)> + 'a {
    state
        .iter()
        .map(move |(name, tensor)| (format!("{}{}", prefix, name), tensor))
}

fn insert_descriptor_metadata(
    metadata: &mut HashMap<String, String>,
    descriptor: &ModelDescriptor,
) -> Result<()> {
    metadata.insert(CLASS_KEY.to_string(), descriptor.class.clone());
    metadata.insert(ARGS_KEY.to_string(), serde_json::to_string(&descriptor.args)?);
    metadata.insert(KWARGS_KEY.to_string(), serde_json::to_string(&descriptor.kwargs)?);
    Ok(())
}

fn read_safetensors(bytes: &[u8], device: &Device) -> Result<ModelPackage> {
    let (_, header) = SafeTensors::read_metadata(bytes)
        .map_err(|e| Error::Deserialization(format!("Unrecognized package format: {}", e)))?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let tensors = candle_core::safetensors::load_buffer(bytes, device)
        .map_err(|e| Error::Deserialization(format!("Failed to load tensors: {}", e)))?;

    if metadata.get(FORMAT_KEY).map(String::as_str) != Some(FORMAT_NAME) {
        return Ok(ModelPackage::RawWeights(tensors));
    }

    match metadata.get(LAYOUT_KEY).map(String::as_str) {
        Some(DESCRIPTOR_LAYOUT) => {
            let mut split = split_prefixes(tensors, &[DESCRIPTOR_PREFIX])?;
            let state = split.remove(DESCRIPTOR_PREFIX).unwrap_or_default();
            Ok(ModelPackage::Descriptor(descriptor_from_metadata(
                &metadata, state,
            )?))
        }
        Some(STRUCTURED_LAYOUT) => {
            let mut split = split_prefixes(tensors, &[MODEL_PREFIX, BEST_PREFIX])?;
            let state = split.remove(MODEL_PREFIX).unwrap_or_default();
            let has_best = metadata.get(HAS_BEST_KEY).map(String::as_str) == Some("true");
            let best_state = split.remove(BEST_PREFIX);
            let best_state = if has_best {
                Some(best_state.unwrap_or_default())
            } else {
                best_state
            };
            Ok(ModelPackage::Structured {
                model: descriptor_from_metadata(&metadata, state)?,
                best_state,
            })
        }
        Some(other) => Err(Error::Deserialization(format!(
            "Unknown package layout: {}",
            other
        ))),
        None => Err(Error::Deserialization(
            "Package metadata is missing its layout".to_string(),
        )),
    }
}

/// Groups tensors by name prefix, stripping it. Prefixes must be disjoint;
/// a tensor matching none of them is an error.
fn split_prefixes(
    tensors: HashMap<String, Tensor>,
    prefixes: &[&'static str],
) -> Result<HashMap<&'static str, StateDict>> {
    let mut groups: HashMap<&'static str, StateDict> = HashMap::new();
    for (name, tensor) in tensors {
        let (prefix, rest) = prefixes
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix).map(|rest| (*prefix, rest)))
            .ok_or_else(|| {
                Error::Deserialization(format!("Unexpected tensor in package: {}", name))
            })?;
        groups
            .entry(prefix)
            .or_default()
            .insert(rest.to_string(), tensor);
    }
    Ok(groups)
}

fn descriptor_from_metadata(
    metadata: &HashMap<String, String>,
    state: StateDict,
) -> Result<ModelDescriptor> {
    let class = metadata
        .get(CLASS_KEY)
        .cloned()
        .ok_or_else(|| Error::Deserialization("Package descriptor has no class".to_string()))?;

    let args: Vec<Value> = match metadata.get(ARGS_KEY) {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| Error::Deserialization(format!("Invalid descriptor args: {}", e)))?,
        None => Vec::new(),
    };
    let kwargs: Map<String, Value> = match metadata.get(KWARGS_KEY) {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| Error::Deserialization(format!("Invalid descriptor kwargs: {}", e)))?,
        None => Map::new(),
    };

    Ok(ModelDescriptor {
        class,
        args,
        kwargs,
        state,
    })
}
