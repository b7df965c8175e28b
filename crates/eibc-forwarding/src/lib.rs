//! Packet forwarding with a grace period.
//!
//! Assets that arrive on the hub with forward metadata are not sent on at
//! once. They stay in hub escrow until the hub reaches the instruction's
//! `hold_until` height, which gives the source rollapp's dispute window
//! time to pass. Until then the forward can be cancelled.

use eibc_types::{EibcError, ForwardState, InstructionId};
use thiserror::Error;

pub mod controller;

pub use controller::{ForwardGraceController, TickReport};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
	#[error("forward instruction {0} not found")]
	NotFound(InstructionId),

	#[error("forward instruction {id} is no longer held: {state:?}")]
	NotHeld { id: InstructionId, state: ForwardState },

	#[error("forward escrow failed: {0}")]
	Escrow(String),
}

impl From<ForwardError> for EibcError {
	fn from(err: ForwardError) -> Self {
		match err {
			ForwardError::NotFound(id) => EibcError::NotFound(format!("forward {}", id)),
			other => EibcError::Forwarding(other.to_string()),
		}
	}
}
