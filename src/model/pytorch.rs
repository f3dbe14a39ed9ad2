//! PyTorch checkpoint reading.
//!
//! A `torch.save` archive is a zip holding `<dir>/data.pkl` plus one entry
//! per storage under `<dir>/data/`. The pickle is walked with candle's
//! unpickler and classified by its top-level keys: a `model` entry means a
//! training envelope, `class` and `state` mean a bare descriptor, anything
//! else is a plain state dict.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use candle_core::pickle::{Object, Stack, TensorInfo};
use candle_core::{Device, Tensor};
use serde_json::{Map, Number, Value};
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::model::demucs::StateDict;
use crate::model::package::{ModelDescriptor, ModelPackage};

const MODEL_KEY: &str = "model";
const BEST_STATE_KEY: &str = "best_state";
const CLASS_KEY: &str = "class";
const ARGS_KEY: &str = "args";
const KWARGS_KEY: &str = "kwargs";
const STATE_KEY: &str = "state";

type Entries = Vec<(String, Object)>;

pub(crate) fn read_package(path: &Path, device: &Device) -> Result<ModelPackage> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(zip_error)?;

    let (dir_name, root) = read_pickle(&mut archive)?;
    let mut checkpoint = Checkpoint {
        archive: &mut archive,
        dir_name,
        device,
    };

    let entries = match root {
        Object::Dict(items) => string_keys(items),
        other => {
            return Err(Error::Deserialization(format!(
                "PyTorch checkpoint does not hold a mapping: {}",
                kind(&other)
            )))
        }
    };

    if has_key(&entries, MODEL_KEY) {
        let mut entries = entries;
        let model = take(&mut entries, MODEL_KEY).unwrap_or(Object::None);
        let model = checkpoint.descriptor(mapping(model, MODEL_KEY)?)?;
        let best_state = match take(&mut entries, BEST_STATE_KEY) {
            None | Some(Object::None) => None,
            Some(state) => Some(checkpoint.state_dict(mapping(state, BEST_STATE_KEY)?)?),
        };
        Ok(ModelPackage::Structured { model, best_state })
    } else if has_key(&entries, CLASS_KEY) && has_key(&entries, STATE_KEY) {
        Ok(ModelPackage::Descriptor(checkpoint.descriptor(entries)?))
    } else {
        Ok(ModelPackage::RawWeights(checkpoint.state_dict(entries)?))
    }
}

/// Unpickles the archive's `data.pkl`, returning the storage directory next
/// to it and the root object.
fn read_pickle<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<(PathBuf, Object)> {
    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Deserialization("PyTorch checkpoint has no data.pkl".to_string())
        })?;
    let dir_name = PathBuf::from(pickle_name.trim_end_matches(".pkl"));

    let entry = archive.by_name(&pickle_name).map_err(zip_error)?;
    let mut reader = BufReader::new(entry);
    let mut stack = Stack::empty();
    stack
        .read_loop(&mut reader)
        .map_err(|e| Error::Deserialization(format!("Failed to unpickle {}: {}", pickle_name, e)))?;
    let root = stack
        .finalize()
        .map_err(|e| Error::Deserialization(format!("Failed to unpickle {}: {}", pickle_name, e)))?;

    // scripted modules wrap their state in a `__torch__.Module` build
    let root = match root {
        Object::Build { callable, args } => match *callable {
            Object::Reduce { callable, .. }
                if matches!(
                    callable.as_ref(),
                    Object::Class { module_name, class_name }
                        if module_name == "__torch__" && class_name == "Module"
                ) =>
            {
                *args
            }
            callable => Object::Build {
                callable: Box::new(callable),
                args,
            },
        },
        root => root,
    };

    Ok((dir_name, root))
}

struct Checkpoint<'a, R> {
    archive: &'a mut ZipArchive<R>,
    dir_name: PathBuf,
    device: &'a Device,
}

impl<R: Read + Seek> Checkpoint<'_, R> {
    fn descriptor(&mut self, mut entries: Entries) -> Result<ModelDescriptor> {
        let class = match take(&mut entries, CLASS_KEY) {
            Some(Object::Class {
                module_name,
                class_name,
            }) => format!("{}.{}", module_name, class_name),
            Some(Object::Unicode(name)) => name,
            Some(other) => {
                return Err(Error::Deserialization(format!(
                    "Descriptor class is not a class reference: {}",
                    kind(&other)
                )))
            }
            None => {
                return Err(Error::Deserialization(
                    "Package descriptor has no class".to_string(),
                ))
            }
        };

        let args = match take(&mut entries, ARGS_KEY) {
            None | Some(Object::None) => Vec::new(),
            Some(Object::Tuple(items)) | Some(Object::List(items)) => items
                .into_iter()
                .map(to_json)
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::Deserialization(format!(
                    "Descriptor args must be a sequence, got {}",
                    kind(&other)
                )))
            }
        };

        let kwargs = match take(&mut entries, KWARGS_KEY) {
            None | Some(Object::None) => Map::new(),
            Some(kwargs) => match to_json(kwargs)? {
                Value::Object(map) => map,
                other => {
                    return Err(Error::Deserialization(format!(
                        "Descriptor kwargs must be a mapping, got {}",
                        other
                    )))
                }
            },
        };

        let state = match take(&mut entries, STATE_KEY) {
            Some(state) => self.state_dict(mapping(state, STATE_KEY)?)?,
            None => {
                return Err(Error::Deserialization(
                    "Package descriptor has no state".to_string(),
                ))
            }
        };

        Ok(ModelDescriptor {
            class,
            args,
            kwargs,
            state,
        })
    }

    /// Loads every tensor entry. Non-tensor entries such as `_metadata` are
    /// skipped.
    fn state_dict(&mut self, entries: Entries) -> Result<StateDict> {
        let mut state = StateDict::new();
        for (name, value) in entries {
            let info = value
                .into_tensor_info(Object::Unicode(name.clone()), &self.dir_name)
                .map_err(|e| {
                    Error::Deserialization(format!("Invalid tensor record {}: {}", name, e))
                })?;
            match info {
                Some(info) => {
                    let tensor = self.tensor(&info)?;
                    state.insert(name, tensor);
                }
                None => tracing::debug!("Skipping non-tensor entry {}", name),
            }
        }

        tracing::debug!("Loaded {} tensors from PyTorch checkpoint", state.len());
        Ok(state)
    }

    fn tensor(&mut self, info: &TensorInfo) -> Result<Tensor> {
        let layout = &info.layout;
        let contiguous = layout.is_contiguous();
        if !contiguous && !layout.is_fortran_contiguous() {
            return Err(Error::Deserialization(format!(
                "Cannot read non-contiguous tensor {} ({:?})",
                info.name, layout
            )));
        }

        let mut bytes = Vec::new();
        self.archive
            .by_name(&info.path)
            .map_err(zip_error)?
            .read_to_end(&mut bytes)?;

        let start = layout.start_offset();
        let len = layout.shape().elem_count() * info.dtype.size_in_bytes();
        let data = bytes.get(start..start + len).ok_or_else(|| {
            Error::Deserialization(format!(
                "Storage for {} holds {} bytes, needs {}",
                info.name,
                bytes.len(),
                start + len
            ))
        })?;

        let dims = layout.dims();
        let tensor = if contiguous || dims.len() < 2 {
            Tensor::from_raw_buffer(data, info.dtype, dims, self.device)
        } else {
            let reversed: Vec<usize> = dims.iter().rev().copied().collect();
            let order: Vec<usize> = (0..dims.len()).rev().collect();
            Tensor::from_raw_buffer(data, info.dtype, &reversed, self.device)
                .and_then(|t| t.permute(order))
                .and_then(|t| t.contiguous())
        };
        tensor.map_err(|e| Error::Deserialization(format!("Failed to load {}: {}", info.name, e)))
    }
}

/// Keeps entries whose keys are strings; torch never keys tensors otherwise.
fn string_keys(items: Vec<(Object, Object)>) -> Entries {
    items
        .into_iter()
        .filter_map(|(key, value)| match key {
            Object::Unicode(key) => Some((key, value)),
            _ => None,
        })
        .collect()
}

fn mapping(object: Object, field: &str) -> Result<Entries> {
    match object {
        Object::Dict(items) => Ok(string_keys(items)),
        other => Err(Error::Deserialization(format!(
            "Expected '{}' to be a mapping, got {}",
            field,
            kind(&other)
        ))),
    }
}

fn has_key(entries: &Entries, key: &str) -> bool {
    entries.iter().any(|(name, _)| name == key)
}

fn take(entries: &mut Entries, key: &str) -> Option<Object> {
    let index = entries.iter().position(|(name, _)| name == key)?;
    Some(entries.swap_remove(index).1)
}

/// Converts a constructor argument to JSON. Only plain Python values are
/// accepted.
fn to_json(object: Object) -> Result<Value> {
    match object {
        Object::None => Ok(Value::Null),
        Object::Bool(value) => Ok(Value::Bool(value)),
        Object::Int(value) => Ok(Value::from(value)),
        Object::Long(value) => Ok(Value::from(value)),
        Object::Float(value) => Number::from_f64(value).map(Value::Number).ok_or_else(|| {
            Error::Deserialization(format!("Non-finite argument value {}", value))
        }),
        Object::Unicode(value) => Ok(Value::String(value)),
        Object::Tuple(items) | Object::List(items) => items
            .into_iter()
            .map(to_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Object::Dict(items) => {
            let mut map = Map::new();
            for (key, value) in items {
                match key {
                    Object::Unicode(key) => {
                        map.insert(key, to_json(value)?);
                    }
                    other => {
                        return Err(Error::Deserialization(format!(
                            "Argument mapping has a non-string key: {}",
                            kind(&other)
                        )))
                    }
                }
            }
            Ok(Value::Object(map))
        }
        other => Err(Error::Deserialization(format!(
            "Unsupported argument value: {}",
            kind(&other)
        ))),
    }
}

fn kind(object: &Object) -> &'static str {
    match object {
        Object::Class { .. } => "class",
        Object::Int(_) | Object::Long(_) => "int",
        Object::Float(_) => "float",
        Object::Unicode(_) => "str",
        Object::Bool(_) => "bool",
        Object::None => "None",
        Object::Tuple(_) => "tuple",
        Object::List(_) => "list",
        Object::Mark => "mark",
        Object::Dict(_) => "dict",
        Object::Reduce { .. } => "object",
        Object::Build { .. } => "object",
        Object::PersistentLoad(_) => "storage",
    }
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Deserialization(format!("Invalid PyTorch archive: {}", e))
}
