// eibc-core/src/error.rs

use eibc_forwarding::ForwardError;
use eibc_settlement::FinalizationError;
use eibc_state::LedgerError;
use eibc_types::{BankError, EibcError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
	#[error("Invalid request: {0}")]
	InvalidRequest(String),

	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),

	#[error("Finalization error: {0}")]
	Finalization(#[from] FinalizationError),

	#[error("Forwarding error: {0}")]
	Forwarding(#[from] ForwardError),

	#[error("Bank error: {0}")]
	Bank(#[from] BankError),

	#[error("Lifecycle error: {0}")]
	Lifecycle(String),

	#[error("Not found: {0}")]
	NotFound(String),
}

impl From<CoreError> for EibcError {
	fn from(err: CoreError) -> Self {
		match err {
			CoreError::Ledger(e) => e.into(),
			CoreError::Finalization(e) => e.into(),
			CoreError::Forwarding(e) => e.into(),
			CoreError::Bank(e) => e.into(),
			CoreError::NotFound(what) => EibcError::NotFound(what),
			other => EibcError::Settlement(other.to_string()),
		}
	}
}
