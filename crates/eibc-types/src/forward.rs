//! Packet-forward instructions held on the hub during the grace period.

use crate::{
	common::{Address, Amount, ChainName, Height},
	errors::Result,
	transfer::{DenomTrace, PacketHandle},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type InstructionId = String;

/// What the hub should do with a forwarded asset once it may leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
	/// Derived from the inbound packet key.
	pub id: InstructionId,
	/// Chain the asset arrived from.
	pub source: ChainName,
	/// Height on `source` the inbound packet was sent at.
	pub source_height: Height,
	/// Hub account the inbound packet named; it holds the funds on cancel.
	pub intermediate_receiver: Address,
	pub receiver: Address,
	pub next_port: String,
	pub next_channel: String,
	#[serde(with = "duration_nanos")]
	pub timeout: Duration,
	pub retries: Option<u8>,
	/// Memo passed on to the next hop verbatim.
	pub next_memo: Option<String>,
	pub denom_trace: DenomTrace,
	#[serde(with = "crate::serde_helpers::amount")]
	pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ForwardState {
	Held,
	Forwarded { packet: PacketHandle, at: Height },
	Cancelled { at: Height },
	/// Retry budget used up; funds stay with the intermediate receiver.
	Failed { at: Height },
	/// The source rollapp was reverted past the inbound packet; the escrow
	/// was burned.
	Reverted { at: Height },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardInstruction {
	#[serde(flatten)]
	pub request: ForwardRequest,
	pub received_at: Height,
	/// Never recomputed after scheduling.
	pub hold_until: Height,
	#[serde(flatten)]
	pub state: ForwardState,
	pub attempts: u32,
	pub last_error: Option<String>,
	pub next_attempt_at: Height,
}

impl ForwardInstruction {
	pub fn new(request: ForwardRequest, received_at: Height, grace_period_blocks: Height) -> Self {
		let hold_until = received_at.saturating_add(grace_period_blocks);
		Self {
			request,
			received_at,
			hold_until,
			state: ForwardState::Held,
			attempts: 0,
			last_error: None,
			next_attempt_at: hold_until,
		}
	}

	pub fn id(&self) -> &str {
		&self.request.id
	}

	pub fn is_held(&self) -> bool {
		matches!(self.state, ForwardState::Held)
	}

	/// Whether a send may be attempted at hub height `now`.
	pub fn is_due(&self, now: Height) -> bool {
		self.is_held() && now >= self.hold_until && now >= self.next_attempt_at
	}

	/// Whether the retry budget is used up. Without `retries` it never is.
	pub fn attempts_exhausted(&self) -> bool {
		match self.request.retries {
			Some(retries) => self.attempts > u32::from(retries),
			None => false,
		}
	}
}

/// Returned by `schedule`; identifies an instruction for `cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardHandle {
	pub id: InstructionId,
	pub hold_until: Height,
}

/// Sends a held asset to its next hop. Implementations must be idempotent
/// per instruction id: a repeated send of the same instruction returns the
/// packet of the first successful one.
#[async_trait]
pub trait ForwardTransport: Send + Sync {
	async fn send(&self, instruction: &ForwardInstruction) -> Result<PacketHandle>;
}

mod duration_nanos {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(value.as_nanos() as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request() -> ForwardRequest {
		ForwardRequest {
			id: "abc".to_string(),
			source: "rollappevm_1234-1".to_string(),
			source_height: 7,
			intermediate_receiver: "dym1hub".to_string(),
			receiver: "cosmos1dest".to_string(),
			next_port: "transfer".to_string(),
			next_channel: "channel-1".to_string(),
			timeout: Duration::from_secs(300),
			retries: Some(1),
			next_memo: None,
			denom_trace: DenomTrace::parse("transfer/channel-0/urax"),
			amount: 100,
		}
	}

	#[test]
	fn test_hold_until_is_fixed_at_creation() {
		let instruction = ForwardInstruction::new(request(), 10, 100);
		assert_eq!(instruction.hold_until, 110);
		assert!(!instruction.is_due(109));
		assert!(instruction.is_due(110));
	}

	#[test]
	fn test_retry_budget() {
		let mut instruction = ForwardInstruction::new(request(), 0, 0);
		instruction.attempts = 1;
		assert!(!instruction.attempts_exhausted());
		instruction.attempts = 2;
		assert!(instruction.attempts_exhausted());
	}

	#[test]
	fn test_instruction_serializes_flat() {
		let instruction = ForwardInstruction::new(request(), 5, 10);
		let json = serde_json::to_value(&instruction).unwrap();
		assert_eq!(json["state"], "held");
		assert_eq!(json["hold_until"], 15);
		assert_eq!(json["timeout"], 300_000_000_000u64);
		assert_eq!(json["amount"], "100");
	}
}
