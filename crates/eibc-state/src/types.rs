//! Ledger error types.

use eibc_types::{Amount, BankError, EibcError, OrderId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
	#[error("fee {fee} must be smaller than amount {amount}")]
	FeeExceedsAmount { fee: Amount, amount: Amount },

	#[error("Demand order already exists: {0}")]
	DuplicateOrder(OrderId),

	#[error("Demand order not found: {0}")]
	NotFound(OrderId),

	#[error(transparent)]
	Bank(#[from] BankError),
}

impl From<LedgerError> for EibcError {
	fn from(err: LedgerError) -> Self {
		match err {
			LedgerError::NotFound(id) => EibcError::NotFound(format!("demand order {}", id)),
			other => EibcError::Ledger(other.to_string()),
		}
	}
}
