//! Error types for the eIBC system.

use crate::common::Height;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EibcError>;

#[derive(Error, Debug)]
pub enum EibcError {
	#[error("Chain error: {0}")]
	Chain(String),

	#[error("Memo error: {0}")]
	Memo(String),

	#[error("Ledger error: {0}")]
	Ledger(String),

	#[error("Bank error: {0}")]
	Bank(String),

	#[error("Settlement error: {0}")]
	Settlement(String),

	#[error("Forwarding error: {0}")]
	Forwarding(String),

	#[error("Configuration error: {0}")]
	Config(String),

	#[error("Invalid event: {0}")]
	InvalidEvent(String),

	#[error("Transient read failure at height {height}: {reason}")]
	TransientRead { height: Height, reason: String },

	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Timed out: {0}")]
	Timeout(String),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl EibcError {
	/// Read failures that are worth retrying at the same height.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::TransientRead { .. } | Self::Timeout(_))
	}
}
