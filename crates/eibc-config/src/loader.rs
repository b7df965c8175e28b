//! Configuration loading from files and environment.

use crate::{types::EibcConfig, ConfigError};
use anyhow::{Context, Result};
use regex::Regex;
use std::{collections::HashSet, env, path::Path};
use tracing::{debug, info};

const ENV_PREFIX: &str = "EIBC_";

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
	/// Load configuration from file
	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<EibcConfig> {
		let path = path.as_ref();
		info!("Loading configuration from {:?}", path);

		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("Failed to read config file: {:?}", path))?;
		let contents = Self::substitute_env_vars(&contents)?;

		let mut config = match path.extension().and_then(|s| s.to_str()) {
			Some("toml") => Self::from_toml(&contents)?,
			Some("json") => Self::from_json(&contents)?,
			Some("yaml") | Some("yml") => Self::from_yaml(&contents)?,
			_ => anyhow::bail!("Unsupported config format: {:?}", path),
		};

		Self::apply_env_overrides(&mut config)?;
		Self::validate_config(&config)?;
		Ok(config)
	}

	/// Load from TOML string
	pub fn from_toml(contents: &str) -> Result<EibcConfig> {
		toml::from_str(contents).map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))
	}

	/// Load from JSON string
	pub fn from_json(contents: &str) -> Result<EibcConfig> {
		serde_json::from_str(contents).context("Failed to parse JSON")
	}

	/// Load from YAML string
	pub fn from_yaml(contents: &str) -> Result<EibcConfig> {
		serde_yaml::from_str(contents).context("Failed to parse YAML")
	}

	/// Replaces every `${VAR}` with the value of environment variable `VAR`.
	pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
		let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
			.map_err(|e| ConfigError::ParseError(e.to_string()))?;

		let mut missing = None;
		let result = re.replace_all(content, |caps: &regex::Captures| {
			let name = &caps[1];
			env::var(name).unwrap_or_else(|_| {
				missing.get_or_insert_with(|| name.to_string());
				String::new()
			})
		});

		match missing {
			Some(name) => Err(ConfigError::EnvVarNotFound(name)),
			None => Ok(result.into_owned()),
		}
	}

	/// Apply environment variable overrides
	pub fn apply_env_overrides(config: &mut EibcConfig) -> Result<(), ConfigError> {
		if let Ok(level) = env::var(format!("{}LOG_LEVEL", ENV_PREFIX)) {
			debug!("Overriding log level from environment");
			config.logging.level = level;
		}

		if let Ok(host) = env::var(format!("{}API_HOST", ENV_PREFIX)) {
			config.api.host = host;
		}

		if let Ok(port) = env::var(format!("{}API_PORT", ENV_PREFIX)) {
			config.api.port = port
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid API port: {}", e)))?;
		}

		if let Ok(block_time) = env::var(format!("{}BLOCK_TIME_MS", ENV_PREFIX)) {
			config.hub.block_time_ms = block_time.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid block time: {}", e))
			})?;
		}

		Ok(())
	}

	/// Validate configuration
	pub fn validate_config(config: &EibcConfig) -> Result<(), ConfigError> {
		let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

		if config.hub.chain_id.is_empty() {
			return invalid("Hub chain id must not be empty".to_string());
		}
		if config.hub.block_time_ms == 0 {
			return invalid("Hub block time must be greater than zero".to_string());
		}
		if config.rollapps.is_empty() {
			return invalid("At least one rollapp must be configured".to_string());
		}

		let mut channels = HashSet::new();
		for (rollapp_id, rollapp) in &config.rollapps {
			if rollapp.dispute_period_in_blocks == 0 {
				return invalid(format!(
					"Rollapp {} must have a dispute period greater than zero",
					rollapp_id
				));
			}
			if !channels.insert(rollapp.hub_channel.as_str()) {
				return invalid(format!(
					"Hub channel {} is used by more than one chain",
					rollapp.hub_channel
				));
			}
		}
		for (chain_id, counterparty) in &config.counterparties {
			if !channels.insert(counterparty.hub_channel.as_str()) {
				return invalid(format!(
					"Hub channel {} of counterparty {} is already in use",
					counterparty.hub_channel, chain_id
				));
			}
		}

		if config.forwarding.retry_interval_blocks == 0 {
			return invalid("Forward retry interval must be greater than zero".to_string());
		}
		if config.scanner.initial_backoff_ms > config.scanner.max_backoff_ms {
			return invalid("Scanner initial backoff exceeds max backoff".to_string());
		}
		if config.logging.level.trim().is_empty() {
			return invalid("Log level must not be empty".to_string());
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	const TOML: &str = r#"
[hub]
chain_id = "dymension_100-1"
denom = "adym"
block_time_ms = 1000

[rollapps."rollappevm_1234-1"]
dispute_period_in_blocks = 80
hub_channel = "channel-0"
rollapp_channel = "channel-0"
denom = "urax"

[counterparties."cosmoshub-4"]
hub_channel = "channel-1"
channel = "channel-7"

[forwarding]
retry_interval_blocks = 2

[api]
host = "127.0.0.1"
port = 9000

[logging]
level = "debug"
json = true
"#;

	#[test]
	fn test_toml_parsing() {
		let config = ConfigLoader::from_toml(TOML).unwrap();
		assert_eq!(config.hub.chain_id, "dymension_100-1");
		let rollapp = &config.rollapps["rollappevm_1234-1"];
		assert_eq!(rollapp.dispute_period_in_blocks, 80);
		assert_eq!(config.counterparties["cosmoshub-4"].channel, "channel-7");
		assert_eq!(config.forwarding.retry_interval_blocks, 2);
		assert_eq!(config.scanner.max_retries, 3);
		assert_eq!(config.finalization.poll_interval_ms, 500);
		assert!(config.logging.json);
		ConfigLoader::validate_config(&config).unwrap();
	}

	#[test]
	fn test_json_and_yaml_parsing() {
		let json = r#"{
			"hub": { "chain_id": "dymension_100-1", "denom": "adym" },
			"rollapps": {
				"rollappevm_1234-1": { "dispute_period_in_blocks": 20, "hub_channel": "channel-0", "denom": "urax" }
			}
		}"#;
		let config = ConfigLoader::from_json(json).unwrap();
		assert_eq!(config.hub.block_time_ms, 1_000);
		assert_eq!(config.rollapps["rollappevm_1234-1"].rollapp_channel, "channel-0");
		assert_eq!(config.api.port, 8080);

		let yaml = "
hub:
  chain_id: dymension_100-1
  denom: adym
rollapps:
  rollappevm_1234-1:
    dispute_period_in_blocks: 20
    hub_channel: channel-0
    denom: urax
";
		assert_eq!(ConfigLoader::from_yaml(yaml).unwrap(), config);
	}

	#[test]
	fn test_validation() {
		let mut config = ConfigLoader::from_toml(TOML).unwrap();
		config
			.rollapps
			.get_mut("rollappevm_1234-1")
			.unwrap()
			.dispute_period_in_blocks = 0;
		assert!(matches!(
			ConfigLoader::validate_config(&config),
			Err(ConfigError::ValidationError(msg)) if msg.contains("dispute period")
		));

		let mut config = ConfigLoader::from_toml(TOML).unwrap();
		config.counterparties.get_mut("cosmoshub-4").unwrap().hub_channel = "channel-0".into();
		assert!(ConfigLoader::validate_config(&config).is_err());

		let mut config = ConfigLoader::from_toml(TOML).unwrap();
		config.rollapps.clear();
		assert!(ConfigLoader::validate_config(&config).is_err());

		let mut config = ConfigLoader::from_toml(TOML).unwrap();
		config.hub.block_time_ms = 0;
		assert!(ConfigLoader::validate_config(&config).is_err());
	}

	#[test]
	fn test_env_substitution() {
		env::set_var("EIBC_TEST_HUB_DENOM", "adym");
		let out = ConfigLoader::substitute_env_vars("denom = \"${EIBC_TEST_HUB_DENOM}\"").unwrap();
		assert_eq!(out, "denom = \"adym\"");

		assert_eq!(
			ConfigLoader::substitute_env_vars("x = \"${EIBC_TEST_SURELY_UNSET}\""),
			Err(ConfigError::EnvVarNotFound("EIBC_TEST_SURELY_UNSET".to_string()))
		);
	}

	#[test]
	fn test_from_file_by_extension() {
		let dir = tempfile::tempdir().unwrap();

		let path = dir.path().join("eibc.toml");
		std::fs::File::create(&path)
			.unwrap()
			.write_all(TOML.as_bytes())
			.unwrap();
		let config = ConfigLoader::from_file(&path).unwrap();
		assert_eq!(config.counterparties.len(), 1);

		let unsupported = dir.path().join("eibc.ini");
		std::fs::write(&unsupported, TOML).unwrap();
		assert!(ConfigLoader::from_file(&unsupported)
			.unwrap_err()
			.to_string()
			.contains("Unsupported config format"));

		assert!(ConfigLoader::from_file(dir.path().join("missing.toml")).is_err());
	}

	#[test]
	fn test_bundled_config_is_valid() {
		let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/eibc.toml");
		let config = ConfigLoader::from_toml(&std::fs::read_to_string(path).unwrap()).unwrap();
		ConfigLoader::validate_config(&config).unwrap();
		assert_eq!(config.rollapps.len(), 1);
	}
}
