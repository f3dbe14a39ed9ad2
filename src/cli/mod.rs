use crate::error::{Error, Result};
use crate::loader::ModelSelection;
use crate::model::Variant;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "denoiser")]
#[command(version, about = "Load pretrained Demucs denoising models", long_about = None)]
pub struct Cli {
	/// Directory holding downloaded weights
	#[arg(long, global = true, env = "DENOISER_CACHE_DIR")]
	pub cache_dir: Option<PathBuf>,

	/// Serve the dns48 weights from this file instead of downloading them
	#[arg(long, global = true, env = "DENOISER_MODEL_PATH")]
	pub dns48_path: Option<PathBuf>,

	/// Verify downloads against the hash embedded in their file name
	#[arg(long, global = true)]
	pub check_hash: bool,

	/// Device to load weights on (e.g., "cpu" or "cuda:0")
	#[arg(long, global = true, default_value = "cpu")]
	pub device: String,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Load a model and print its summary
	Load {
		#[command(flatten)]
		model: ModelFlags,
	},

	/// Download a pretrained variant into the cache
	Fetch {
		#[command(flatten)]
		model: ModelFlags,
	},

	/// List pretrained variants and their cache status
	List,
}

/// Model selection flags. At most one may be given; none means dns48.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
#[group(multiple = false)]
pub struct ModelFlags {
	/// Path to local trained model
	#[arg(short = 'm', long, alias = "model_path", value_name = "PATH")]
	pub model_path: Option<PathBuf>,

	/// Use pre-trained real time H=48 model trained on DNS
	#[arg(long)]
	pub dns48: bool,

	/// Use pre-trained real time H=64 model trained on DNS
	#[arg(long)]
	pub dns64: bool,

	/// Use pre-trained real time H=64 model trained on DNS and Valentini
	#[arg(long)]
	pub master64: bool,

	/// Use pre-trained H=64 model trained on Valentini, non causal
	#[arg(long, alias = "valentini_nc")]
	pub valentini_nc: bool,
}

impl ModelFlags {
	pub fn from_variant(variant: Variant) -> Self {
		let mut flags = Self::default();
		match variant {
			Variant::Dns48 => flags.dns48 = true,
			Variant::Dns64 => flags.dns64 = true,
			Variant::Master64 => flags.master64 = true,
			Variant::ValentiniNc => flags.valentini_nc = true,
		}
		flags
	}

	/// The single active selection, `None` when nothing was given.
	pub fn selection(&self) -> Result<Option<ModelSelection>> {
		let mut selected = Vec::new();

		if let Some(path) = &self.model_path {
			selected.push(ModelSelection::Path(path.clone()));
		}
		let variants = [
			(self.dns48, Variant::Dns48),
			(self.dns64, Variant::Dns64),
			(self.master64, Variant::Master64),
			(self.valentini_nc, Variant::ValentiniNc),
		];
		for (enabled, variant) in variants {
			if enabled {
				selected.push(ModelSelection::Variant(variant));
			}
		}

		if selected.len() > 1 {
			let names: Vec<String> = selected.iter().map(ToString::to_string).collect();
			return Err(Error::Configuration(format!(
				"Model selections are mutually exclusive, got: {}",
				names.join(", ")
			)));
		}

		Ok(selected.pop())
	}
}
