//! Chain-related types and traits.

use crate::{
	common::{Amount, Height, TxHash},
	errors::Result,
	events::ChainEvent,
	transfer::{PacketHandle, TransferRequest},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of a transaction that made it into a block.
///
/// `code == 0` means the messages executed; any other code means the
/// transaction was included but execution failed, with the reason in
/// `raw_log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
	pub hash: TxHash,
	pub height: Height,
	pub code: u32,
	pub raw_log: String,
	pub events: Vec<ChainEvent>,
}

impl TxResult {
	pub fn is_success(&self) -> bool {
		self.code == 0
	}

	/// Events of the given type, in emission order.
	pub fn events_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a ChainEvent> + 'a {
		self.events.iter().filter(move |e| e.kind == kind)
	}
}

/// Answers whether a rollapp height can no longer be disputed.
#[async_trait]
pub trait FinalityOracle: Send + Sync {
	async fn is_height_finalized(&self, rollapp_id: &str, height: Height) -> Result<bool>;
}

/// Read/write access to a chain, as used by the settlement core.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
	fn chain_id(&self) -> &str;

	/// Latest committed height.
	async fn height(&self) -> Result<Height>;

	async fn query_balance(&self, address: &str, denom: &str) -> Result<Amount>;

	/// Initiates a cross-chain transfer and returns the committed packet.
	async fn submit_transfer(&self, request: TransferRequest) -> Result<PacketHandle>;

	/// Resolves once the chain has reached `height`.
	async fn wait_for_height(&self, height: Height) -> Result<()>;

	/// Indexed transactions of one block. May fail transiently.
	async fn txs_at(&self, height: Height) -> Result<Vec<TxResult>>;

	async fn is_height_finalized(&self, rollapp_id: &str, height: Height) -> Result<bool>;

	async fn get_transaction(&self, hash: &str) -> Result<Option<TxResult>>;
}
