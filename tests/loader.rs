use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use denoiser::cli::ModelFlags;
use denoiser::model::{ModelDescriptor, StateDict};
use denoiser::{
    Demucs, DemucsConfig, Error, LoaderConfig, ModelLoader, ModelPackage, ModelSelection, Result,
    Variant, WeightSource, WeightStore,
};
use tempfile::TempDir;

/// Serves remote URLs from local files and records every request.
#[derive(Default)]
struct RecordingStore {
    files: HashMap<String, PathBuf>,
    requests: RefCell<Vec<WeightSource>>,
}

impl RecordingStore {
    fn serve(&mut self, url: String, path: PathBuf) {
        self.files.insert(url, path);
    }

    fn requests(&self) -> Vec<WeightSource> {
        self.requests.borrow().clone()
    }
}

impl WeightStore for RecordingStore {
    fn fetch(&self, source: &WeightSource) -> Result<PathBuf> {
        self.requests.borrow_mut().push(source.clone());
        match source {
            WeightSource::Remote { url } => self
                .files
                .get(url)
                .cloned()
                .ok_or_else(|| Error::NotFound(url.clone())),
            WeightSource::Local { path } if path.exists() => Ok(path.clone()),
            WeightSource::Local { path } => Err(Error::NotFound(path.display().to_string())),
        }
    }
}

fn filled_state(config: &DemucsConfig, value: f32) -> StateDict {
    config
        .parameter_shapes()
        .into_iter()
        .map(|(name, shape)| (name, Tensor::full(value, shape, &Device::Cpu).unwrap()))
        .collect()
}

fn write_weights(dir: &Path, name: &str, config: &DemucsConfig, value: f32) -> PathBuf {
    let path = dir.join(name);
    candle_core::safetensors::save(&filled_state(config, value), &path).unwrap();
    path
}

fn small_config() -> DemucsConfig {
    DemucsConfig {
        hidden: 4,
        depth: 2,
        ..DemucsConfig::default()
    }
}

fn small_descriptor(value: f32) -> ModelDescriptor {
    let config = small_config();
    ModelDescriptor {
        class: "denoiser.demucs.Demucs".to_string(),
        args: Vec::new(),
        kwargs: config.to_kwargs().unwrap(),
        state: filled_state(&config, value),
    }
}

fn first_value(model: &Demucs, name: &str) -> f32 {
    model
        .parameter(name)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()[0]
}

fn setup() -> (TempDir, LoaderConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = LoaderConfig::with_cache_dir(dir.path().join("cache")).unwrap();
    (dir, config)
}

#[test]
fn every_variant_loads_its_fixed_architecture() {
    let (dir, config) = setup();
    let mut store = RecordingStore::default();

    let dns48 = write_weights(dir.path(), "dns48.safetensors", &Variant::Dns48.config(), 0.1);
    let h64 = write_weights(dir.path(), "h64.safetensors", &Variant::Dns64.config(), 0.2);
    let nc = write_weights(dir.path(), "nc.safetensors", &Variant::ValentiniNc.config(), 0.3);
    store.serve(Variant::Dns48.url(&config.remote_root), dns48);
    store.serve(Variant::Dns64.url(&config.remote_root), h64.clone());
    store.serve(Variant::Master64.url(&config.remote_root), h64);
    store.serve(Variant::ValentiniNc.url(&config.remote_root), nc);

    let loader = ModelLoader::with_store(config, &store, Device::Cpu);

    let expected = [
        (Variant::Dns48, 48, true, 4, 4, 0.1),
        (Variant::Dns64, 64, true, 4, 4, 0.2),
        (Variant::Master64, 64, true, 4, 4, 0.2),
        (Variant::ValentiniNc, 64, false, 2, 2, 0.3),
    ];
    for (variant, hidden, causal, stride, resample, value) in expected {
        let model = loader
            .resolve(Some(&ModelSelection::Variant(variant)))
            .unwrap();
        let config = model.config();
        assert_eq!(config.hidden, hidden, "{variant}");
        assert_eq!(config.causal, causal, "{variant}");
        assert_eq!(config.stride, stride, "{variant}");
        assert_eq!(config.resample, resample, "{variant}");
        assert_eq!(config.sample_rate, 16_000, "{variant}");
        assert_eq!(first_value(&model, "encoder.0.0.weight"), value, "{variant}");
    }

    assert_eq!(store.requests().len(), 4);
}

#[test]
fn default_selection_matches_dns48() {
    let (dir, config) = setup();
    let mut store = RecordingStore::default();
    let weights = write_weights(dir.path(), "dns48.safetensors", &Variant::Dns48.config(), 0.7);
    store.serve(Variant::Dns48.url(&config.remote_root), weights);

    let loader = ModelLoader::with_store(config, &store, Device::Cpu);
    let implicit = loader.resolve(None).unwrap();
    let explicit = loader
        .resolve(Some(&ModelSelection::Variant(Variant::Dns48)))
        .unwrap();

    assert_eq!(implicit.config(), explicit.config());
    assert_eq!(
        first_value(&implicit, "lstm.lstm.weight_hh_l1"),
        first_value(&explicit, "lstm.lstm.weight_hh_l1")
    );

    let requests = store.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
}

#[test]
fn dns48_override_is_read_from_disk() {
    let (dir, config) = setup();
    let weights = write_weights(dir.path(), "local.safetensors", &Variant::Dns48.config(), 0.4);
    let config = config.dns48_override(Some(weights.clone()));
    let store = RecordingStore::default();

    let loader = ModelLoader::with_store(config, &store, Device::Cpu);
    let model = loader.resolve(None).unwrap();

    assert_eq!(first_value(&model, "decoder.4.2.bias"), 0.4);
    assert_eq!(store.requests(), vec![WeightSource::Local { path: weights }]);
}

#[test]
fn missing_dns48_override_is_not_found() {
    let (dir, config) = setup();
    let config = config.dns48_override(Some(dir.path().join("nowhere.th")));
    let store = RecordingStore::default();

    let loader = ModelLoader::with_store(config, &store, Device::Cpu);
    assert!(loader.resolve(None).unwrap_err().is_not_found());
}

#[test]
fn best_state_overrides_packaged_state() {
    let (dir, config) = setup();
    let path = dir.path().join("checkpoint.safetensors");
    ModelPackage::Structured {
        model: small_descriptor(1.0),
        best_state: Some(filled_state(&small_config(), 2.0)),
    }
    .save(&path)
    .unwrap();

    let store = RecordingStore::default();
    let loader = ModelLoader::with_store(config, &store, Device::Cpu);
    let model = loader.resolve(Some(&ModelSelection::Path(path))).unwrap();

    assert_eq!(model.config(), &small_config());
    for (name, _) in small_config().parameter_shapes() {
        assert_eq!(first_value(&model, &name), 2.0, "{name}");
    }
    assert!(store.requests().is_empty());
}

#[test]
fn bare_descriptor_package_round_trips() {
    let (dir, config) = setup();
    let mut original = Demucs::new(small_config(), &Device::Cpu).unwrap();
    original
        .load_state_dict(filled_state(&small_config(), 0.5))
        .unwrap();

    let path = dir.path().join("model.safetensors");
    ModelPackage::Descriptor(original.to_descriptor().unwrap())
        .save(&path)
        .unwrap();

    let loader = ModelLoader::with_store(config, RecordingStore::default(), Device::Cpu);
    let reloaded = loader.resolve(Some(&ModelSelection::Path(path))).unwrap();

    assert_eq!(reloaded.config(), original.config());
    let original_state = original.state_dict().unwrap();
    let reloaded_state = reloaded.state_dict().unwrap();
    assert_eq!(original_state.len(), reloaded_state.len());
    for (name, tensor) in &original_state {
        let a = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = reloaded_state[name]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(a, b, "{name}");
    }
}

#[test]
fn conflicting_flags_fail_before_any_fetch() {
    let (_dir, config) = setup();
    let store = RecordingStore::default();
    let loader = ModelLoader::with_store(config, &store, Device::Cpu);

    let flags = ModelFlags {
        dns64: true,
        master64: true,
        ..ModelFlags::default()
    };
    let err = loader.resolve_flags(&flags).unwrap_err();

    assert!(err.is_configuration());
    assert!(store.requests().is_empty());
}

#[test]
fn missing_model_path_is_not_found_without_fetching() {
    let (dir, config) = setup();
    let store = RecordingStore::default();
    let loader = ModelLoader::with_store(config, &store, Device::Cpu);

    let flags = ModelFlags {
        model_path: Some(dir.path().join("missing.th")),
        ..ModelFlags::default()
    };
    let err = loader.resolve_flags(&flags).unwrap_err();

    assert!(err.is_not_found());
    assert!(store.requests().is_empty());
}

#[test]
fn raw_weights_at_model_path_are_rejected() {
    let (dir, config) = setup();
    let path = write_weights(dir.path(), "weights.safetensors", &small_config(), 1.0);

    let loader = ModelLoader::with_store(config, RecordingStore::default(), Device::Cpu);
    let err = loader
        .resolve(Some(&ModelSelection::Path(path)))
        .unwrap_err();
    assert!(err.is_deserialization());
}

#[test]
fn package_with_wrong_shapes_is_rejected() {
    let (dir, config) = setup();
    let mut descriptor = small_descriptor(1.0);
    descriptor.state = filled_state(
        &DemucsConfig {
            hidden: 8,
            ..small_config()
        },
        1.0,
    );
    let path = dir.path().join("mismatch.safetensors");
    ModelPackage::Descriptor(descriptor).save(&path).unwrap();

    let loader = ModelLoader::with_store(config, RecordingStore::default(), Device::Cpu);
    let err = loader
        .resolve(Some(&ModelSelection::Path(path)))
        .unwrap_err();
    assert!(err.is_deserialization());
}

#[test]
fn variant_weights_must_match_variant_architecture() {
    let (dir, config) = setup();
    let mut store = RecordingStore::default();
    let weights = write_weights(dir.path(), "tiny.safetensors", &small_config(), 1.0);
    store.serve(Variant::Dns64.url(&config.remote_root), weights);

    let loader = ModelLoader::with_store(config, &store, Device::Cpu);
    let err = loader
        .resolve(Some(&ModelSelection::Variant(Variant::Dns64)))
        .unwrap_err();
    assert!(err.is_deserialization());
}

#[test]
fn unreachable_variant_is_not_found() {
    let (_dir, config) = setup();
    let store = RecordingStore::default();
    let loader = ModelLoader::with_store(config, &store, Device::Cpu);

    let err = loader
        .resolve(Some(&ModelSelection::Variant(Variant::Master64)))
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.requests().len(), 1);
}
