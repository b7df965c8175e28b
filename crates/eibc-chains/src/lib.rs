//! Chain adapters for the eIBC settlement core.
//!
//! The settlement core only talks to chains through the traits in
//! `eibc-types`. This crate provides the implementations:
//!
//! - `implementations::local`: an in-process hub with its rollapps and
//!   counterparty chains. Balances, heights, indexed transactions and
//!   rollapp finality are modelled; consensus and relaying are not.

pub mod implementations;

pub use implementations::local::{
	CounterpartyChain, LocalForwardTransport, LocalHub, LocalRollapp, RollappFinality,
	StateUpdate,
};

use eibc_types::{EibcError, Height};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
	#[error("unknown rollapp {0}")]
	UnknownRollapp(String),

	#[error("no counterparty on channel {0}")]
	UnknownChannel(String),

	#[error("state update for {rollapp_id} must end above {last}, got {end_height}")]
	StaleStateUpdate {
		rollapp_id: String,
		last: Height,
		end_height: Height,
	},

	#[error("channel {0} is unavailable")]
	ChannelUnavailable(String),

	#[error("{0}")]
	Bank(#[from] eibc_types::BankError),
}

impl From<ChainError> for EibcError {
	fn from(err: ChainError) -> Self {
		match err {
			ChainError::Bank(e) => e.into(),
			other => EibcError::Chain(other.to_string()),
		}
	}
}
