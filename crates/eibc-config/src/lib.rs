//! Configuration for the eIBC service.
//!
//! Files may be TOML, JSON or YAML (picked by extension). `${VAR}`
//! references are substituted from the environment before parsing and a
//! few `EIBC_*` variables override parsed values afterwards.

use thiserror::Error;

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),
}

impl From<ConfigError> for eibc_types::EibcError {
	fn from(err: ConfigError) -> Self {
		eibc_types::EibcError::Config(err.to_string())
	}
}
