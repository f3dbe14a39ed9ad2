use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("Configuration error: {0}")]
	Configuration(String),

	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Failed to deserialize model: {0}")]
	Deserialization(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	Serialization(String),
}

impl Error {
	pub fn is_configuration(&self) -> bool {
		matches!(self, Error::Configuration(_))
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound(_))
	}

	pub fn is_deserialization(&self) -> bool {
		matches!(self, Error::Deserialization(_))
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Serialization(err.to_string())
	}
}

impl From<toml::de::Error> for Error {
	fn from(err: toml::de::Error) -> Self {
		Error::Serialization(err.to_string())
	}
}

impl From<toml::ser::Error> for Error {
	fn from(err: toml::ser::Error) -> Self {
		Error::Serialization(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
