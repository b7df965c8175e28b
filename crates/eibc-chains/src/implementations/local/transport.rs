//! Outbound packets from the hub to counterparty chains.

use super::channel_escrow_address;
use crate::ChainError;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use eibc_state::MemoryBank;
use eibc_types::{
	BankKeeper, DenomTrace, ForwardInstruction, ForwardTransport, InstructionId, PacketHandle,
	TransferRequest, ESCROW_ACCOUNT,
};
use std::sync::{
	atomic::{AtomicU32, AtomicU64, Ordering},
	Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A chain at the other end of a hub channel.
pub struct CounterpartyChain {
	pub chain_id: String,
	/// Port and channel on the counterparty side.
	pub port: String,
	pub channel: String,
	pub bank: Arc<MemoryBank>,
}

struct Route {
	counterparty: Arc<CounterpartyChain>,
	next_sequence: AtomicU64,
	/// Sends to fail before the channel works again.
	failures: AtomicU32,
}

/// Moves tokens from the hub to counterparty chains: the hub escrows them
/// per channel and the counterparty credits the receiver in the voucher
/// denom of the received trace. Forwards are sent at most once per
/// instruction id.
pub struct LocalForwardTransport {
	hub_bank: Arc<MemoryBank>,
	routes: DashMap<String, Route>,
	sent: DashMap<InstructionId, PacketHandle>,
	send_lock: Mutex<()>,
}

impl LocalForwardTransport {
	pub fn new(hub_bank: Arc<MemoryBank>) -> Self {
		Self {
			hub_bank,
			routes: DashMap::new(),
			sent: DashMap::new(),
			send_lock: Mutex::new(()),
		}
	}

	/// Opens hub channel `hub_channel` to `counterparty`.
	pub fn connect(&self, hub_channel: &str, counterparty: Arc<CounterpartyChain>) {
		info!(
			channel = %hub_channel,
			counterparty = %counterparty.chain_id,
			"Channel opened"
		);
		self.routes.insert(
			hub_channel.to_string(),
			Route {
				counterparty,
				next_sequence: AtomicU64::new(1),
				failures: AtomicU32::new(0),
			},
		);
	}

	pub fn counterparty(&self, hub_channel: &str) -> Option<Arc<CounterpartyChain>> {
		self.routes
			.get(hub_channel)
			.map(|r| r.counterparty.clone())
	}

	/// The next `times` sends over `hub_channel` fail.
	pub fn fail_next(&self, hub_channel: &str, times: u32) -> Result<(), ChainError> {
		let route = self
			.routes
			.get(hub_channel)
			.ok_or_else(|| ChainError::UnknownChannel(hub_channel.to_string()))?;
		route.failures.store(times, Ordering::SeqCst);
		Ok(())
	}

	/// Packet of the forward `id`, once it has been sent.
	pub fn sent(&self, id: &str) -> Option<PacketHandle> {
		self.sent.get(id).map(|p| p.clone())
	}

	/// Sends `request` from the hub. `request.denom` is the full trace of
	/// the token on the hub.
	pub async fn transfer(&self, request: &TransferRequest) -> Result<PacketHandle, ChainError> {
		let route = self
			.routes
			.get(&request.source_channel)
			.ok_or_else(|| ChainError::UnknownChannel(request.source_channel.clone()))?;
		if route
			.failures
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
		{
			warn!(channel = %request.source_channel, "Channel refused packet");
			return Err(ChainError::ChannelUnavailable(request.source_channel.clone()));
		}
		let counterparty = route.counterparty.clone();
		let sequence = route.next_sequence.fetch_add(1, Ordering::SeqCst);
		drop(route);

		let trace = DenomTrace::parse(&request.denom);
		self.hub_bank
			.send(
				&request.sender,
				&channel_escrow_address(&request.source_port, &request.source_channel),
				&trace.ibc_denom(),
				request.amount,
			)
			.await?;

		let received = DenomTrace::on_receive(
			&request.source_port,
			&request.source_channel,
			&counterparty.port,
			&counterparty.channel,
			&trace.full_path(),
		);
		counterparty
			.bank
			.mint(&request.receiver, &received.ibc_denom(), request.amount)
			.await?;

		let packet = PacketHandle {
			source_port: request.source_port.clone(),
			source_channel: request.source_channel.clone(),
			sequence,
		};
		debug!(
			packet = %packet,
			counterparty = %counterparty.chain_id,
			receiver = %request.receiver,
			denom = %received,
			"Packet delivered"
		);
		Ok(packet)
	}
}

#[async_trait]
impl ForwardTransport for LocalForwardTransport {
	async fn send(&self, instruction: &ForwardInstruction) -> eibc_types::Result<PacketHandle> {
		let _guard = self.send_lock.lock().await;
		if let Entry::Occupied(sent) = self.sent.entry(instruction.id().to_string()) {
			return Ok(sent.get().clone());
		}

		let request = &instruction.request;
		let packet = self
			.transfer(&TransferRequest {
				source_port: request.next_port.clone(),
				source_channel: request.next_channel.clone(),
				sender: ESCROW_ACCOUNT.to_string(),
				receiver: request.receiver.clone(),
				denom: request.denom_trace.full_path(),
				amount: request.amount,
				memo: request.next_memo.clone().unwrap_or_default(),
			})
			.await?;
		self.sent.insert(instruction.id().to_string(), packet.clone());
		Ok(packet)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use eibc_types::{ForwardRequest, TRANSFER_PORT};
	use std::time::Duration;

	fn setup() -> (Arc<MemoryBank>, Arc<CounterpartyChain>, LocalForwardTransport) {
		let hub_bank = Arc::new(MemoryBank::new());
		let counterparty = Arc::new(CounterpartyChain {
			chain_id: "cosmoshub-4".to_string(),
			port: TRANSFER_PORT.to_string(),
			channel: "channel-7".to_string(),
			bank: Arc::new(MemoryBank::new()),
		});
		let transport = LocalForwardTransport::new(hub_bank.clone());
		transport.connect("channel-1", counterparty.clone());
		(hub_bank, counterparty, transport)
	}

	fn instruction() -> ForwardInstruction {
		ForwardInstruction::new(
			ForwardRequest {
				id: "fwd".to_string(),
				source: "rollappevm_1234-1".to_string(),
				source_height: 1,
				intermediate_receiver: "dym1hub".to_string(),
				receiver: "cosmos1dest".to_string(),
				next_port: TRANSFER_PORT.to_string(),
				next_channel: "channel-1".to_string(),
				timeout: Duration::from_secs(300),
				retries: None,
				next_memo: None,
				denom_trace: DenomTrace::parse("transfer/channel-0/urax"),
				amount: 1_000,
			},
			0,
			0,
		)
	}

	#[tokio::test]
	async fn test_forward_moves_escrow_to_counterparty() {
		let (hub_bank, counterparty, transport) = setup();
		let hub_denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();
		hub_bank.mint(ESCROW_ACCOUNT, &hub_denom, 1_000).await.unwrap();

		let packet = transport.send(&instruction()).await.unwrap();
		assert_eq!(packet.sequence, 1);
		assert_eq!(hub_bank.balance(ESCROW_ACCOUNT, &hub_denom).await, 0);
		assert_eq!(
			hub_bank
				.balance(&channel_escrow_address("transfer", "channel-1"), &hub_denom)
				.await,
			1_000
		);

		let second_hop = DenomTrace::parse("transfer/channel-7/transfer/channel-0/urax").ibc_denom();
		assert_eq!(counterparty.bank.balance("cosmos1dest", &second_hop).await, 1_000);

		// Same instruction again: same packet, nothing moves.
		assert_eq!(transport.send(&instruction()).await.unwrap(), packet);
		assert_eq!(counterparty.bank.balance("cosmos1dest", &second_hop).await, 1_000);
	}

	#[tokio::test]
	async fn test_injected_failures_and_unknown_channels() {
		let (hub_bank, _, transport) = setup();
		let hub_denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();
		hub_bank.mint(ESCROW_ACCOUNT, &hub_denom, 1_000).await.unwrap();

		transport.fail_next("channel-1", 1).unwrap();
		assert!(transport.send(&instruction()).await.is_err());
		assert_eq!(hub_bank.balance(ESCROW_ACCOUNT, &hub_denom).await, 1_000);
		assert!(transport.send(&instruction()).await.is_ok());

		assert!(matches!(
			transport.fail_next("channel-99", 1),
			Err(ChainError::UnknownChannel(_))
		));
	}
}
