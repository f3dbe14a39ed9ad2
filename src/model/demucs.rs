//! Demucs construction and weight loading.
//!
//! Only the parameter layout lives here: which tensors a given set of
//! hyperparameters implies and with what shapes. The forward pass belongs to
//! the inference side.

use std::collections::{HashMap, HashSet};
use std::fmt;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::package::ModelDescriptor;

/// Parameter name -> tensor.
pub type StateDict = HashMap<String, Tensor>;

pub const CLASS_NAME: &str = "Demucs";

const LSTM_LAYERS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemucsConfig {
    pub chin: usize,
    pub chout: usize,
    pub hidden: usize,
    pub depth: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub causal: bool,
    pub resample: usize,
    pub growth: f64,
    pub max_hidden: usize,
    pub normalize: bool,
    pub glu: bool,
    pub rescale: f64,
    pub floor: f64,
    pub sample_rate: u32,
}

impl Default for DemucsConfig {
    fn default() -> Self {
        Self {
            chin: 1,
            chout: 1,
            hidden: 48,
            depth: 5,
            kernel_size: 8,
            stride: 4,
            causal: true,
            resample: 4,
            growth: 2.0,
            max_hidden: 10_000,
            normalize: true,
            glu: true,
            rescale: 0.1,
            floor: 1e-3,
            sample_rate: 16_000,
        }
    }
}

impl DemucsConfig {
    /// Constructor argument order, used to name positional arguments.
    pub const ARGUMENTS: [&'static str; 15] = [
        "chin",
        "chout",
        "hidden",
        "depth",
        "kernel_size",
        "stride",
        "causal",
        "resample",
        "growth",
        "max_hidden",
        "normalize",
        "glu",
        "rescale",
        "floor",
        "sample_rate",
    ];

    pub fn validate(&self) -> Result<()> {
        if ![1, 2, 4].contains(&self.resample) {
            return Err(Error::Configuration(format!(
                "Resampling factor must be 1, 2 or 4, got {}",
                self.resample
            )));
        }
        if self.depth == 0 || self.hidden == 0 || self.kernel_size == 0 || self.stride == 0 {
            return Err(Error::Configuration(format!(
                "depth, hidden, kernel_size and stride must be positive: {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Builds a config from positional and keyword constructor arguments.
    /// Keyword arguments the constructor does not know are dropped.
    pub fn from_arguments(args: &[Value], kwargs: &Map<String, Value>) -> Result<Self> {
        if args.len() > Self::ARGUMENTS.len() {
            return Err(Error::Deserialization(format!(
                "{} takes at most {} positional arguments, got {}",
                CLASS_NAME,
                Self::ARGUMENTS.len(),
                args.len()
            )));
        }

        let mut merged: Map<String, Value> = Self::ARGUMENTS
            .iter()
            .zip(args)
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();

        for (key, value) in kwargs {
            if !Self::ARGUMENTS.contains(&key.as_str()) {
                tracing::warn!("Dropping inexistent parameter {}", key);
                continue;
            }
            if merged.contains_key(key) {
                return Err(Error::Deserialization(format!(
                    "{} got multiple values for argument '{}'",
                    CLASS_NAME, key
                )));
            }
            merged.insert(key.clone(), value.clone());
        }

        let config: DemucsConfig = serde_json::from_value(Value::Object(merged)).map_err(|e| {
            Error::Deserialization(format!("Invalid {} arguments: {}", CLASS_NAME, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_kwargs(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Serialization(format!(
                "Expected a map of arguments, got {}",
                other
            ))),
        }
    }

    fn ch_scale(&self) -> usize {
        if self.glu {
            2
        } else {
            1
        }
    }

    /// Width of the LSTM sitting between encoder and decoder.
    pub fn lstm_dim(&self) -> usize {
        let mut chin = self.chin;
        let mut hidden = self.hidden;
        for _ in 0..self.depth {
            chin = hidden;
            hidden = self.grow(hidden);
        }
        chin
    }

    fn grow(&self, hidden: usize) -> usize {
        ((self.growth * hidden as f64) as usize).min(self.max_hidden)
    }

    /// Every parameter the architecture owns, in registration order.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut encoder = Vec::new();
        let mut decoder = Vec::new();
        let ch_scale = self.ch_scale();
        let k = self.kernel_size;

        let mut chin = self.chin;
        let mut chout = self.chout;
        let mut hidden = self.hidden;
        for index in 0..self.depth {
            let enc = format!("encoder.{}", index);
            encoder.push((format!("{enc}.0.weight"), vec![hidden, chin, k]));
            encoder.push((format!("{enc}.0.bias"), vec![hidden]));
            encoder.push((format!("{enc}.2.weight"), vec![hidden * ch_scale, hidden, 1]));
            encoder.push((format!("{enc}.2.bias"), vec![hidden * ch_scale]));

            // decoder layers are stacked in reverse
            let dec = format!("decoder.{}", self.depth - 1 - index);
            decoder.push(vec![
                (format!("{dec}.0.weight"), vec![hidden * ch_scale, hidden, 1]),
                (format!("{dec}.0.bias"), vec![hidden * ch_scale]),
                (format!("{dec}.2.weight"), vec![hidden, chout, k]),
                (format!("{dec}.2.bias"), vec![chout]),
            ]);

            chout = hidden;
            chin = hidden;
            hidden = self.grow(hidden);
        }

        let mut shapes = encoder;
        shapes.extend(decoder.into_iter().rev().flatten());
        shapes.extend(lstm_shapes(chin, !self.causal));
        shapes
    }

    pub fn num_parameters(&self) -> usize {
        self.parameter_shapes()
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }
}

fn lstm_shapes(dim: usize, bidirectional: bool) -> Vec<(String, Vec<usize>)> {
    let directions: &[&str] = if bidirectional { &["", "_reverse"] } else { &[""] };
    let mut shapes = Vec::new();

    for layer in 0..LSTM_LAYERS {
        let input = if layer == 0 {
            dim
        } else {
            dim * directions.len()
        };
        for suffix in directions {
            let p = "lstm.lstm";
            shapes.push((format!("{p}.weight_ih_l{layer}{suffix}"), vec![4 * dim, input]));
            shapes.push((format!("{p}.weight_hh_l{layer}{suffix}"), vec![4 * dim, dim]));
            shapes.push((format!("{p}.bias_ih_l{layer}{suffix}"), vec![4 * dim]));
            shapes.push((format!("{p}.bias_hh_l{layer}{suffix}"), vec![4 * dim]));
        }
    }

    if bidirectional {
        shapes.push(("lstm.linear.weight".to_string(), vec![dim, 2 * dim]));
        shapes.push(("lstm.linear.bias".to_string(), vec![dim]));
    }
    shapes
}

fn is_bias(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .map(|leaf| leaf.starts_with("bias"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub class: String,
    pub config: DemucsConfig,
    pub lstm_dim: usize,
    pub num_parameters: usize,
    pub num_tensors: usize,
}

/// A Demucs instance with its weights populated.
pub struct Demucs {
    config: DemucsConfig,
    varmap: VarMap,
    device: Device,
}

impl Demucs {
    /// Builds an un-initialized model: every parameter exists with its final
    /// shape, holding fresh init values until weights are loaded.
    pub fn new(config: DemucsConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        for (name, shape) in config.parameter_shapes() {
            let init = if is_bias(&name) {
                Init::Const(0.)
            } else {
                candle_nn::init::DEFAULT_KAIMING_UNIFORM
            };
            vb.get_with_hints(shape, &name, init).map_err(|e| {
                Error::Deserialization(format!("Failed to allocate {}: {}", name, e))
            })?;
        }

        Ok(Self {
            config,
            varmap,
            device: device.clone(),
        })
    }

    /// Deserializes a descriptor into a live model. The class may be given
    /// bare or with its module path.
    pub fn from_descriptor(descriptor: ModelDescriptor, device: &Device) -> Result<Self> {
        let class = descriptor.class.rsplit('.').next().unwrap_or_default();
        if class != CLASS_NAME {
            return Err(Error::Deserialization(format!(
                "Unsupported model class: {}",
                descriptor.class
            )));
        }

        let config = DemucsConfig::from_arguments(&descriptor.args, &descriptor.kwargs)?;
        let mut model = Self::new(config, device)?;
        model.load_state_dict(descriptor.state)?;
        Ok(model)
    }

    /// Strict load: names and shapes must match the architecture exactly.
    pub fn load_state_dict(&mut self, state: StateDict) -> Result<()> {
        let expected = self.config.parameter_shapes();

        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for (name, shape) in &expected {
            match state.get(name) {
                None => missing.push(name.clone()),
                Some(tensor) if tensor.dims() != shape.as_slice() => mismatched.push(format!(
                    "{}: expected {:?}, got {:?}",
                    name,
                    shape,
                    tensor.dims()
                )),
                Some(_) => {}
            }
        }

        let known: HashSet<&str> = expected.iter().map(|(name, _)| name.as_str()).collect();
        let mut unexpected: Vec<&String> = state
            .keys()
            .filter(|name| !known.contains(name.as_str()))
            .collect();
        unexpected.sort();

        if !missing.is_empty() || !unexpected.is_empty() || !mismatched.is_empty() {
            return Err(Error::Deserialization(format!(
                "State dict does not match {} architecture (missing: {:?}, unexpected: {:?}, mismatched: {:?})",
                CLASS_NAME, missing, unexpected, mismatched
            )));
        }

        for (name, tensor) in state {
            let tensor = tensor
                .to_device(&self.device)
                .and_then(|t| t.to_dtype(DType::F32))
                .map_err(|e| Error::Deserialization(format!("Failed to convert {}: {}", name, e)))?;
            self.varmap
                .set_one(&name, tensor)
                .map_err(|e| Error::Deserialization(format!("Failed to load {}: {}", name, e)))?;
        }

        Ok(())
    }

    /// Detached copy of the current weights.
    pub fn state_dict(&self) -> Result<StateDict> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Deserialization("Weight map lock poisoned".to_string()))?;

        let state = data
            .iter()
            .map(|(name, var)| {
                var.as_tensor()
                    .copy()
                    .map(|tensor| (name.clone(), tensor))
                    .map_err(|e| Error::Deserialization(format!("Failed to copy {}: {}", name, e)))
            })
            .collect::<Result<StateDict>>()?;
        Ok(state)
    }

    pub fn parameter(&self, name: &str) -> Option<Tensor> {
        let data = self.varmap.data().lock().ok()?;
        let tensor = data.get(name).map(|var| var.as_tensor().clone());
        tensor
    }

    pub fn to_descriptor(&self) -> Result<ModelDescriptor> {
        Ok(ModelDescriptor {
            class: CLASS_NAME.to_string(),
            args: Vec::new(),
            kwargs: self.config.to_kwargs()?,
            state: self.state_dict()?,
        })
    }

    pub fn config(&self) -> &DemucsConfig {
        &self.config
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            class: CLASS_NAME.to_string(),
            config: self.config.clone(),
            lstm_dim: self.config.lstm_dim(),
            num_parameters: self.config.num_parameters(),
            num_tensors: self.config.parameter_shapes().len(),
        }
    }
}

impl fmt::Debug for Demucs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(CLASS_NAME)
            .field("config", &self.config)
            .field("num_parameters", &self.config.num_parameters())
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_config() -> DemucsConfig {
        DemucsConfig {
            hidden: 4,
            depth: 2,
            ..DemucsConfig::default()
        }
    }

    fn filled_state(config: &DemucsConfig, value: f32) -> StateDict {
        config
            .parameter_shapes()
            .into_iter()
            .map(|(name, shape)| {
                let tensor = Tensor::full(value, shape, &Device::Cpu).unwrap();
                (name, tensor)
            })
            .collect()
    }

    fn shape_of<'a>(shapes: &'a [(String, Vec<usize>)], name: &str) -> &'a [usize] {
        shapes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_slice())
            .unwrap_or_else(|| panic!("missing {name}"))
    }

    #[test]
    fn dns48_layout() {
        let config = DemucsConfig::default();
        let shapes = config.parameter_shapes();

        // 5 encoder + 5 decoder blocks with 4 tensors each, 2 unidirectional LSTM layers
        assert_eq!(shapes.len(), 40 + 8);
        assert_eq!(config.lstm_dim(), 768);
        assert_eq!(shape_of(&shapes, "encoder.0.0.weight"), &[48, 1, 8]);
        assert_eq!(shape_of(&shapes, "encoder.0.2.weight"), &[96, 48, 1]);
        assert_eq!(shape_of(&shapes, "decoder.0.2.weight"), &[768, 384, 8]);
        assert_eq!(shape_of(&shapes, "decoder.4.2.weight"), &[48, 1, 8]);
        assert_eq!(shape_of(&shapes, "decoder.4.2.bias"), &[1]);
        assert_eq!(shape_of(&shapes, "lstm.lstm.weight_ih_l0"), &[3072, 768]);
        assert!(!shapes.iter().any(|(n, _)| n.starts_with("lstm.linear")));
    }

    #[test]
    fn non_causal_layout_is_bidirectional() {
        let config = DemucsConfig {
            hidden: 64,
            causal: false,
            stride: 2,
            resample: 2,
            ..DemucsConfig::default()
        };
        let shapes = config.parameter_shapes();

        assert_eq!(shapes.len(), 40 + 16 + 2);
        assert_eq!(shape_of(&shapes, "lstm.lstm.weight_ih_l1_reverse"), &[4096, 2048]);
        assert_eq!(shape_of(&shapes, "lstm.linear.weight"), &[1024, 2048]);
    }

    #[test]
    fn max_hidden_caps_growth() {
        let config = DemucsConfig {
            max_hidden: 100,
            ..DemucsConfig::default()
        };
        assert_eq!(config.lstm_dim(), 100);
    }

    #[test]
    fn rejects_unsupported_resample() {
        let config = DemucsConfig {
            resample: 3,
            ..DemucsConfig::default()
        };
        assert!(Demucs::new(config, &Device::Cpu).unwrap_err().is_configuration());
    }

    #[test]
    fn load_state_dict_replaces_weights() {
        let config = small_config();
        let mut model = Demucs::new(config.clone(), &Device::Cpu).unwrap();
        model.load_state_dict(filled_state(&config, 0.5)).unwrap();

        let weight = model.parameter("encoder.1.0.weight").unwrap();
        assert_eq!(weight.dims(), &[8, 4, 8]);
        let values = weight.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 0.5));
    }

    #[test]
    fn load_state_dict_reports_mismatches() {
        let config = small_config();
        let mut model = Demucs::new(config.clone(), &Device::Cpu).unwrap();

        let mut state = filled_state(&config, 1.0);
        state.remove("encoder.0.0.bias");
        state.insert(
            "encoder.0.2.weight".to_string(),
            Tensor::zeros((3, 3, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        state.insert(
            "extra.weight".to_string(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        );

        let err = model.load_state_dict(state).unwrap_err();
        assert!(err.is_deserialization());
        let message = err.to_string();
        assert!(message.contains("encoder.0.0.bias"));
        assert!(message.contains("encoder.0.2.weight"));
        assert!(message.contains("extra.weight"));
    }

    #[test]
    fn descriptor_arguments_resolve_positionally_and_by_name() {
        let args = vec![json!(1), json!(1), json!(4)];
        let mut kwargs = Map::new();
        kwargs.insert("depth".to_string(), json!(2));
        kwargs.insert("causal".to_string(), json!(false));
        kwargs.insert("dropped_option".to_string(), json!(true));

        let config = DemucsConfig::from_arguments(&args, &kwargs).unwrap();
        assert_eq!(config.hidden, 4);
        assert_eq!(config.depth, 2);
        assert!(!config.causal);
        assert_eq!(config.kernel_size, 8);
    }

    #[test]
    fn duplicate_argument_is_rejected() {
        let args = vec![json!(1), json!(1), json!(4)];
        let mut kwargs = Map::new();
        kwargs.insert("hidden".to_string(), json!(8));

        let err = DemucsConfig::from_arguments(&args, &kwargs).unwrap_err();
        assert!(err.is_deserialization());
    }

    #[test]
    fn descriptor_round_trip() {
        let config = small_config();
        let mut model = Demucs::new(config.clone(), &Device::Cpu).unwrap();
        model.load_state_dict(filled_state(&config, 0.25)).unwrap();

        let descriptor = model.to_descriptor().unwrap();
        assert_eq!(descriptor.state.len(), config.parameter_shapes().len());

        let reloaded = Demucs::from_descriptor(descriptor, &Device::Cpu).unwrap();
        assert_eq!(reloaded.config(), &config);
        let summary = reloaded.summary();
        assert_eq!(summary.lstm_dim, 8);
        assert_eq!(summary.num_tensors, 24);
        let bias = reloaded.parameter("lstm.lstm.bias_hh_l1").unwrap();
        assert_eq!(bias.to_vec1::<f32>().unwrap(), vec![0.25; 32]);
    }

    #[test]
    fn unknown_class_is_rejected() {
        let config = small_config();
        let descriptor = ModelDescriptor {
            class: "denoiser.models.Wavenet".to_string(),
            args: Vec::new(),
            kwargs: config.to_kwargs().unwrap(),
            state: filled_state(&config, 0.0),
        };
        assert!(Demucs::from_descriptor(descriptor, &Device::Cpu)
            .unwrap_err()
            .is_deserialization());
    }
}
