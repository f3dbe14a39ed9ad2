use candle_core::Device;
use clap::Parser;
use denoiser::cli::{Cli, Commands};
use denoiser::error::{Error, Result};
use denoiser::store::{CacheIndex, HttpWeightStore, WeightSource, WeightStore};
use denoiser::{LoaderConfig, ModelLoader, ModelSelection, Variant};

fn parse_device(device_str: &str) -> Result<Device> {
    match device_str {
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            let parts: Vec<&str> = s.split(':').collect();
            let ordinal = if parts.len() > 1 {
                parts[1].parse::<usize>().map_err(|_| {
                    Error::Configuration(format!("Invalid CUDA device: {}", s))
                })?
            } else {
                0
            };
            Device::new_cuda(ordinal).map_err(|e| {
                Error::Configuration(format!("Failed to initialize CUDA device: {}", e))
            })
        }
        _ => Err(Error::Configuration(format!("Unknown device: {}", device_str))),
    }
}

fn build_config(cli: &Cli) -> Result<LoaderConfig> {
    let config = match &cli.cache_dir {
        Some(dir) => LoaderConfig::with_cache_dir(dir)?,
        None => LoaderConfig::new()?,
    };
    Ok(config
        .dns48_override(cli.dns48_path.clone())
        .check_hash(cli.check_hash))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    match &cli.command {
        Commands::Load { model } => {
            let selection = model.selection()?;
            let device = parse_device(&cli.device)?;
            let loader = ModelLoader::new(config, device)?;

            let demucs = loader.resolve(selection.as_ref())?;
            let source = selection
                .map(|s| s.to_string())
                .unwrap_or_else(|| Variant::DEFAULT.to_string());

            let output = serde_json::json!({
                "source": source,
                "model": demucs.summary(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Fetch { model } => {
            let variant = match model.selection()? {
                Some(ModelSelection::Variant(variant)) => variant,
                None => Variant::DEFAULT,
                Some(ModelSelection::Path(path)) => {
                    return Err(Error::Configuration(format!(
                        "fetch takes a pretrained variant, not a path ({})",
                        path.display()
                    ))
                    .into());
                }
            };

            let source = variant.source(&config);
            let store = HttpWeightStore::new(config)?;
            let path = store.fetch(&source)?;

            println!("✓ Weights for {} ready", variant);
            println!("  Source: {}", source);
            println!("  Path: {:?}", path);
        }

        Commands::List => {
            let index = CacheIndex::load(&config)?;
            let store = HttpWeightStore::new(config.clone())?;

            println!("Pretrained variants:\n");
            for variant in Variant::all() {
                let model_config = variant.config();
                let source = variant.source(&config);
                let status = match &source {
                    WeightSource::Local { path } if path.exists() => "local",
                    WeightSource::Local { .. } => "missing",
                    WeightSource::Remote { url } if store.is_cached(url) => "cached",
                    WeightSource::Remote { .. } => "remote",
                };

                println!("  {}", variant);
                println!("    {}", variant.description());
                println!(
                    "    hidden={} causal={} stride={} resample={}",
                    model_config.hidden,
                    model_config.causal,
                    model_config.stride,
                    model_config.resample
                );
                println!("    Source: {} ({})", source, status);
                if let Some(entry) = index.get(variant.file_name()) {
                    println!("    Fetched: {} ({} bytes)", entry.fetched_at, entry.size_bytes);
                }
                println!();
            }

            let entries = index.list();
            if !entries.is_empty() {
                println!("Cached files:\n");
                for entry in entries {
                    println!("  {}", entry.file_name);
                    println!("    From: {}", entry.url);
                    println!("    SHA-256: {}", entry.sha256);
                    println!("    Fetched: {} ({} bytes)", entry.fetched_at, entry.size_bytes);
                }
            }
        }
    }

    Ok(())
}
