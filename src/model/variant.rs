//! The fixed table of pretrained checkpoints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::LoaderConfig;
use crate::error::Error;
use crate::model::demucs::DemucsConfig;
use crate::store::WeightSource;

/// Sample rate every published checkpoint was trained at.
pub const PRETRAINED_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Real time H=48 model trained on DNS
    Dns48,
    /// Real time H=64 model trained on DNS
    Dns64,
    /// Real time H=64 model trained on DNS and Valentini
    Master64,
    /// Non causal H=64 model trained on Valentini
    ValentiniNc,
}

/// Non-default construction parameters of a variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchitectureOverrides {
    pub causal: Option<bool>,
    pub stride: Option<usize>,
    pub resample: Option<usize>,
}

impl ArchitectureOverrides {
    pub fn apply(&self, config: &mut DemucsConfig) {
        if let Some(causal) = self.causal {
            config.causal = causal;
        }
        if let Some(stride) = self.stride {
            config.stride = stride;
        }
        if let Some(resample) = self.resample {
            config.resample = resample;
        }
    }
}

impl Variant {
    pub const DEFAULT: Variant = Variant::Dns48;

    pub fn all() -> &'static [Variant] {
        &[
            Variant::Dns48,
            Variant::Dns64,
            Variant::Master64,
            Variant::ValentiniNc,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Variant::Dns48 => "dns48",
            Variant::Dns64 => "dns64",
            Variant::Master64 => "master64",
            Variant::ValentiniNc => "valentini_nc",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Variant::Dns48 => "pre-trained real time H=48 model trained on DNS",
            Variant::Dns64 => "pre-trained real time H=64 model trained on DNS",
            Variant::Master64 => "pre-trained real time H=64 model trained on DNS and Valentini",
            Variant::ValentiniNc => "pre-trained H=64 model trained on Valentini, non causal",
        }
    }

    pub fn hidden_width(&self) -> usize {
        match self {
            Variant::Dns48 => 48,
            Variant::Dns64 | Variant::Master64 | Variant::ValentiniNc => 64,
        }
    }

    pub fn architecture_overrides(&self) -> ArchitectureOverrides {
        match self {
            Variant::ValentiniNc => ArchitectureOverrides {
                causal: Some(false),
                stride: Some(2),
                resample: Some(2),
            },
            _ => ArchitectureOverrides::default(),
        }
    }

    /// Name of the published weight file; the hex segment is a SHA-256 prefix.
    pub fn file_name(&self) -> &'static str {
        match self {
            Variant::Dns48 => "dns48-11decc9d8e3f0998.th",
            Variant::Dns64 => "dns64-a7761ff99a7d5bb6.th",
            Variant::Master64 => "master64-8a5dfb4bb92753dd.th",
            Variant::ValentiniNc => "valentini_nc-93fc4337.th",
        }
    }

    pub fn url(&self, remote_root: &str) -> String {
        format!("{}{}", remote_root, self.file_name())
    }

    pub fn config(&self) -> DemucsConfig {
        let mut config = DemucsConfig {
            hidden: self.hidden_width(),
            sample_rate: PRETRAINED_SAMPLE_RATE,
            ..DemucsConfig::default()
        };
        self.architecture_overrides().apply(&mut config);
        config
    }

    /// Where this variant's weights come from under the given configuration.
    pub fn source(&self, config: &LoaderConfig) -> WeightSource {
        match (self, &config.dns48_override) {
            (Variant::Dns48, Some(path)) => WeightSource::Local { path: path.clone() },
            _ => WeightSource::Remote {
                url: self.url(&config.remote_root),
            },
        }
    }
}

impl Default for Variant {
    fn default() -> Self {
        Variant::DEFAULT
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Variant::all()
            .iter()
            .copied()
            .find(|variant| variant.name() == normalized)
            .ok_or_else(|| Error::Configuration(format!("Unknown model variant: {}", s)))
    }
}
