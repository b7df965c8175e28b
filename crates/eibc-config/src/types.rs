//! Configuration types.

use eibc_types::{ChainName, Height};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EibcConfig {
	pub hub: HubConfig,
	/// Rollapps keyed by chain id
	pub rollapps: BTreeMap<ChainName, RollappConfig>,
	/// Counterparty chains reachable from the hub, keyed by chain id
	#[serde(default)]
	pub counterparties: BTreeMap<ChainName, CounterpartyConfig>,
	#[serde(default)]
	pub forwarding: ForwardingConfig,
	#[serde(default)]
	pub scanner: ScannerConfig,
	#[serde(default)]
	pub finalization: FinalizationConfig,
	#[serde(default)]
	pub api: ApiConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HubConfig {
	pub chain_id: ChainName,
	/// Native staking denom
	pub denom: String,
	/// Interval between produced blocks
	#[serde(default = "default_block_time_ms")]
	pub block_time_ms: u64,
}

impl HubConfig {
	pub fn block_time(&self) -> Duration {
		Duration::from_millis(self.block_time_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RollappConfig {
	/// Hub blocks a state update stays disputable; also the forward grace
	/// period for packets from this rollapp
	pub dispute_period_in_blocks: Height,
	/// Channel on the hub side
	pub hub_channel: String,
	/// Channel on the rollapp side
	#[serde(default = "default_channel")]
	pub rollapp_channel: String,
	/// Native denom of the rollapp
	pub denom: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CounterpartyConfig {
	pub hub_channel: String,
	#[serde(default = "default_channel")]
	pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForwardingConfig {
	/// Blocks between attempts of a failed forward
	pub retry_interval_blocks: Height,
}

impl Default for ForwardingConfig {
	fn default() -> Self {
		Self {
			retry_interval_blocks: 1,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScannerConfig {
	pub max_retries: u32,
	pub initial_backoff_ms: u64,
	pub max_backoff_ms: u64,
}

impl Default for ScannerConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_backoff_ms: 100,
			max_backoff_ms: 2_000,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FinalizationConfig {
	/// How often the service scans new hub blocks for `eibc` events
	pub poll_interval_ms: u64,
}

impl FinalizationConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}
}

impl Default for FinalizationConfig {
	fn default() -> Self {
		Self {
			poll_interval_ms: 500,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApiConfig {
	pub host: String,
	pub port: u16,
	/// Events kept per subscriber before slow readers drop the oldest
	#[serde(default = "default_event_capacity")]
	pub event_capacity: usize,
}

impl Default for ApiConfig {
	fn default() -> Self {
		Self {
			host: "0.0.0.0".to_string(),
			port: 8080,
			event_capacity: default_event_capacity(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
	pub level: String,
	/// JSON lines instead of human-readable output
	#[serde(default)]
	pub json: bool,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			json: false,
		}
	}
}

fn default_block_time_ms() -> u64 {
	1_000
}

fn default_channel() -> String {
	"channel-0".to_string()
}

fn default_event_capacity() -> usize {
	1_024
}
