//! Hub bank interface used by the settlement core.

use crate::{
	common::{Amount, Denom},
	errors::EibcError,
};
use async_trait::async_trait;
use thiserror::Error;

/// Bank errors. The `Display` of `InsufficientFunds` follows the Cosmos SDK
/// wording because callers match on the raw log text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BankError {
	#[error("spendable balance {available}{denom} is smaller than {required}{denom}: insufficient funds")]
	InsufficientFunds {
		address: String,
		denom: Denom,
		available: Amount,
		required: Amount,
	},

	#[error("invalid coins: zero amount of {0}")]
	ZeroAmount(Denom),

	#[error("balance overflow for {address} in {denom}")]
	Overflow { address: String, denom: Denom },
}

impl From<BankError> for EibcError {
	fn from(err: BankError) -> Self {
		EibcError::Bank(err.to_string())
	}
}

/// Balance keeper for the hub. Every call is atomic: either all balances it
/// touches change or none do.
#[async_trait]
pub trait BankKeeper: Send + Sync {
	/// Spendable balance of `address` in `denom`.
	async fn balance(&self, address: &str, denom: &str) -> Amount;

	/// Moves `amount` from `from` to `to`.
	async fn send(&self, from: &str, to: &str, denom: &str, amount: Amount)
		-> Result<(), BankError>;

	/// Creates `amount` new tokens in `to`.
	async fn mint(&self, to: &str, denom: &str, amount: Amount) -> Result<(), BankError>;

	/// Destroys `amount` tokens held by `from`.
	async fn burn(&self, from: &str, denom: &str, amount: Amount) -> Result<(), BankError>;
}
