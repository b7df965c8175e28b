//! Sending side of rollapp-to-hub transfers.

use super::channel_escrow_address;
use crate::ChainError;
use eibc_state::MemoryBank;
use eibc_types::{Amount, BankKeeper, Denom, Height, InboundTransfer, TRANSFER_PORT};
use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};
use tracing::debug;

/// A rollapp with one transfer channel to the hub. Every transfer is
/// committed in a block of its own.
pub struct LocalRollapp {
	chain_id: String,
	/// Channel on the rollapp side.
	channel: String,
	/// Channel on the hub side.
	hub_channel: String,
	denom: Denom,
	bank: Arc<MemoryBank>,
	height: AtomicU64,
	next_sequence: AtomicU64,
}

impl LocalRollapp {
	pub fn new(
		chain_id: impl Into<String>,
		channel: impl Into<String>,
		hub_channel: impl Into<String>,
		denom: impl Into<Denom>,
	) -> Self {
		Self {
			chain_id: chain_id.into(),
			channel: channel.into(),
			hub_channel: hub_channel.into(),
			denom: denom.into(),
			bank: Arc::new(MemoryBank::new()),
			height: AtomicU64::new(0),
			next_sequence: AtomicU64::new(1),
		}
	}

	pub fn chain_id(&self) -> &str {
		&self.chain_id
	}

	pub fn hub_channel(&self) -> &str {
		&self.hub_channel
	}

	pub fn denom(&self) -> &str {
		&self.denom
	}

	pub fn bank(&self) -> &Arc<MemoryBank> {
		&self.bank
	}

	pub fn height(&self) -> Height {
		self.height.load(Ordering::SeqCst)
	}

	/// Produces an empty block.
	pub fn produce_block(&self) -> Height {
		self.height.fetch_add(1, Ordering::SeqCst) + 1
	}

	/// Escrows `amount` of the native denom from `sender` and returns the
	/// packet a relayer would deliver to the hub.
	pub async fn send_transfer(
		&self,
		sender: &str,
		receiver: &str,
		amount: Amount,
		memo: &str,
	) -> Result<InboundTransfer, ChainError> {
		self.bank
			.send(
				sender,
				&channel_escrow_address(TRANSFER_PORT, &self.channel),
				&self.denom,
				amount,
			)
			.await?;
		let source_height = self.produce_block();
		let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);

		debug!(
			rollapp = %self.chain_id,
			sequence,
			height = source_height,
			"Transfer committed"
		);
		Ok(InboundTransfer {
			sequence,
			source_port: TRANSFER_PORT.to_string(),
			source_channel: self.channel.clone(),
			dest_port: TRANSFER_PORT.to_string(),
			dest_channel: self.hub_channel.clone(),
			source_chain: self.chain_id.clone(),
			source_height,
			denom: self.denom.clone(),
			amount,
			sender: sender.to_string(),
			receiver: receiver.to_string(),
			memo: memo.to_string(),
		})
	}
}
