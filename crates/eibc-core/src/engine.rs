//! The hub-side settlement engine.
//!
//! Routes every inbound transfer to the component that owns it, executes
//! fulfillment requests, and advances finality and held forwards on each
//! new hub block.

use crate::{error::CoreError, event_bus::EventBus, lifecycle::LifecycleManager};
use chrono::Utc;
use dashmap::DashSet;
use eibc_forwarding::{ForwardGraceController, TickReport};
use eibc_memo::{EibcMemo, ForwardMemo, MemoResult, ParsedMemo};
use eibc_settlement::{
	FinalizationError, FinalizationMonitor, FinalizationOutcome, FinalizationReport,
	FulfillmentEngine, FulfillmentError, PendingPacket, RevertReport,
};
use eibc_state::{DemandOrderLedger, LedgerError};
use eibc_types::{
	BankKeeper, ChainEvent, ChainName, DemandOrder, DenomTrace, EibcEvent, EngineEvent, FinalityOracle,
	ForwardEvent, ForwardHandle, ForwardInstruction, ForwardRequest, ForwardTransport, Height,
	InboundTransfer, LedgerStats, OrderEvent, OrderFilter, PacketEvent, PacketStatus,
};
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};
use tracing::{debug, info, instrument, warn};

/// Execution codes recorded on fulfillment transactions.
pub mod codes {
	pub const OK: u32 = 0;
	pub const INTERNAL: u32 = 1;
	pub const ORDER_NOT_FOUND: u32 = 2;
	pub const ALREADY_FULFILLED: u32 = 3;
	pub const ORDER_CLOSED: u32 = 4;
	pub const INSUFFICIENT_FUNDS: u32 = 5;
	pub const UNAUTHORIZED: u32 = 6;
}

/// A rollapp connected to the hub, identified by the hub-side channel its
/// packets arrive on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollappRoute {
	pub rollapp_id: ChainName,
	pub hub_channel: String,
	pub dispute_period_in_blocks: Height,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub routes: Vec<RollappRoute>,
	pub retry_interval_blocks: Height,
	pub event_capacity: usize,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			routes: Vec::new(),
			retry_interval_blocks: 1,
			event_capacity: 1024,
		}
	}
}

/// What happened to an inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecvOutcome {
	/// Not from a rollapp; the receiver was credited at once.
	Credited { receiver: String, denom: String },
	OrderCreated { order: DemandOrder },
	/// Escrowed until the rollapp height is final.
	Held { packet: PendingPacket },
	ForwardScheduled { handle: ForwardHandle },
	/// The packet was delivered before; nothing changed.
	Duplicate { packet_id: String },
}

impl RecvOutcome {
	/// Events the receiving transaction emits.
	pub fn chain_events(&self) -> Vec<ChainEvent> {
		match self {
			Self::OrderCreated { order } => vec![EibcEvent::from_order(order).to_chain_event()],
			_ => Vec::new(),
		}
	}
}

/// Execution result of a transaction, before the hub assigns it a hash
/// and height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutcome {
	pub code: u32,
	pub raw_log: String,
	pub events: Vec<ChainEvent>,
}

impl TxOutcome {
	pub fn is_success(&self) -> bool {
		self.code == codes::OK
	}

	fn failed(code: u32, reason: impl std::fmt::Display) -> Self {
		Self {
			code,
			raw_log: format!("failed to execute message; message index: 0: {}", reason),
			events: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReport {
	pub height: Height,
	pub forwards: TickReport,
	pub finalization: FinalizationReport,
}

impl BlockReport {
	/// `eibc` events for orders whose packet status changed in this block.
	pub fn chain_events(&self) -> Vec<ChainEvent> {
		self.finalization
			.finalized_orders
			.iter()
			.map(|order| EibcEvent::from_order(order).to_chain_event())
			.collect()
	}
}

pub struct EibcEngine {
	bank: Arc<dyn BankKeeper>,
	ledger: Arc<DemandOrderLedger>,
	fulfillment: FulfillmentEngine,
	finalization: FinalizationMonitor,
	forwarding: Arc<ForwardGraceController>,
	routes: HashMap<String, RollappRoute>,
	event_bus: EventBus,
	lifecycle: LifecycleManager,
	height: AtomicU64,
	/// Ids of every packet the hub has accepted.
	received: DashSet<String>,
}

impl EibcEngine {
	pub fn new(
		config: EngineConfig,
		bank: Arc<dyn BankKeeper>,
		oracle: Arc<dyn FinalityOracle>,
		transport: Arc<dyn ForwardTransport>,
	) -> Self {
		let ledger = Arc::new(DemandOrderLedger::new(bank.clone()));
		let routes = config
			.routes
			.into_iter()
			.map(|route| (route.hub_channel.clone(), route))
			.collect();

		Self {
			fulfillment: FulfillmentEngine::new(ledger.clone()),
			finalization: FinalizationMonitor::new(ledger.clone(), oracle),
			forwarding: Arc::new(ForwardGraceController::new(
				transport,
				bank.clone(),
				config.retry_interval_blocks,
			)),
			bank,
			ledger,
			routes,
			event_bus: EventBus::new(config.event_capacity),
			lifecycle: LifecycleManager::new(),
			height: AtomicU64::new(0),
			received: DashSet::new(),
		}
	}

	pub async fn start(&self) -> Result<(), CoreError> {
		self.lifecycle.start().await?;
		info!(rollapps = self.routes.len(), "eIBC engine started");
		Ok(())
	}

	pub async fn shutdown(&self) -> Result<(), CoreError> {
		self.lifecycle.shutdown().await
	}

	pub fn lifecycle(&self) -> &LifecycleManager {
		&self.lifecycle
	}

	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	pub fn bank(&self) -> &Arc<dyn BankKeeper> {
		&self.bank
	}

	pub fn forwarding(&self) -> &Arc<ForwardGraceController> {
		&self.forwarding
	}

	/// Last hub height passed to [`Self::on_block`].
	pub fn height(&self) -> Height {
		self.height.load(Ordering::SeqCst)
	}

	pub fn route_for_channel(&self, hub_channel: &str) -> Option<&RollappRoute> {
		self.routes.get(hub_channel)
	}

	pub fn routes(&self) -> impl Iterator<Item = &RollappRoute> {
		self.routes.values()
	}

	/// Handles a transfer packet delivered to the hub at `hub_height`.
	///
	/// Packets from registered rollapps never credit their receiver
	/// directly: they become a demand order, a held forward, or an escrowed
	/// packet released on finality. A memo the hub cannot understand never
	/// fails the transfer.
	#[instrument(skip(self, transfer), fields(packet = %transfer.packet_key()))]
	pub async fn on_recv_packet(
		&self,
		transfer: InboundTransfer,
		hub_height: Height,
	) -> Result<RecvOutcome, CoreError> {
		if transfer.amount == 0 {
			return Err(CoreError::InvalidRequest("transfer amount must be positive".into()));
		}

		// Every path below consumes the packet, whatever its memo says.
		let packet_id = transfer.packet_id();
		if !self.received.insert(packet_id.clone()) {
			debug!(packet_id = %packet_id, "Duplicate packet");
			return Ok(RecvOutcome::Duplicate { packet_id });
		}
		let outcome = self.route_packet(transfer, hub_height).await;
		if outcome.is_err() {
			self.received.remove(&packet_id);
		}
		outcome
	}

	async fn route_packet(
		&self,
		transfer: InboundTransfer,
		hub_height: Height,
	) -> Result<RecvOutcome, CoreError> {
		let trace = transfer.hub_denom_trace();
		let denom = trace.ibc_denom();

		let Some(route) = self.routes.get(&transfer.dest_channel).cloned() else {
			return self.receive_direct(transfer, trace, hub_height).await;
		};
		if route.rollapp_id != transfer.source_chain {
			warn!(
				channel = %transfer.dest_channel,
				expected = %route.rollapp_id,
				claimed = %transfer.source_chain,
				"Packet source does not match channel owner; using channel owner"
			);
		}

		let reason = match eibc_memo::parse(&transfer.memo) {
			MemoResult::Parsed(ParsedMemo {
				eibc: Some(EibcMemo { fee }),
				forward,
			}) => {
				if forward.is_some() {
					warn!("Memo carries both eibc and forward; treating as eibc order");
				}
				let mut transfer = transfer.clone();
				transfer.source_chain = route.rollapp_id.clone();
				match self.ledger.create_order(&transfer, trace.clone(), fee).await {
					Ok(order) => {
						self.event_bus.publish(EngineEvent::Order(OrderEvent::Created {
							order: order.clone(),
						}));
						return Ok(RecvOutcome::OrderCreated { order });
					}
					Err(LedgerError::DuplicateOrder(packet_id)) => {
						debug!(packet_id = %packet_id, "Duplicate packet");
						return Ok(RecvOutcome::Duplicate { packet_id });
					}
					Err(e @ LedgerError::FeeExceedsAmount { .. }) => {
						warn!(error = %e, "Demand order refused; delivering as ordinary transfer");
						e.to_string()
					}
					Err(e) => return Err(e.into()),
				}
			}
			MemoResult::Parsed(ParsedMemo {
				eibc: None,
				forward: Some(forward),
			}) => {
				let handle = self
					.schedule_forward(
						&transfer,
						&route.rollapp_id,
						forward,
						hub_height,
						route.dispute_period_in_blocks,
					)
					.await?;
				return Ok(RecvOutcome::ForwardScheduled { handle });
			}
			MemoResult::Parsed(_) | MemoResult::Ignore => "no eibc memo".to_string(),
			MemoResult::Malformed(e) => {
				warn!(error = %e, "Malformed memo; delivering as ordinary transfer");
				format!("malformed memo: {}", e)
			}
		};

		let packet = PendingPacket {
			packet_id: transfer.packet_id(),
			rollapp_id: route.rollapp_id.clone(),
			source_height: transfer.source_height,
			receiver: transfer.receiver.clone(),
			denom,
			amount: transfer.amount,
			reason,
			status: PacketStatus::Pending,
			received_at: Utc::now(),
		};
		match self.finalization.track(packet.clone()).await {
			Ok(()) => {}
			Err(FinalizationError::DuplicatePacket(packet_id)) => {
				return Ok(RecvOutcome::Duplicate { packet_id })
			}
			Err(e) => return Err(e.into()),
		}
		self.event_bus.publish(EngineEvent::Packet(PacketEvent::Held {
			packet_id: packet.packet_id.clone(),
			rollapp_id: packet.rollapp_id.clone(),
			source_height: packet.source_height,
			reason: packet.reason.clone(),
		}));
		Ok(RecvOutcome::Held { packet })
	}

	/// Executes a fulfillment request.
	///
	/// `Err` means the request could not be submitted at all. A submitted
	/// request always yields a [`TxOutcome`]; a rejected fulfillment has a
	/// non-zero code and the reason in `raw_log`.
	#[instrument(skip(self))]
	pub async fn fulfill(&self, order_id: &str, fulfiller: &str) -> Result<TxOutcome, CoreError> {
		if order_id.trim().is_empty() {
			return Err(CoreError::InvalidRequest("order id is empty".into()));
		}
		if fulfiller.trim().is_empty() {
			return Err(CoreError::InvalidRequest("fulfiller address is empty".into()));
		}

		match self.fulfillment.fulfill(order_id, fulfiller).await {
			Ok(receipt) => {
				self.event_bus.publish(EngineEvent::Order(OrderEvent::Fulfilled {
					order: receipt.order.clone(),
				}));
				Ok(TxOutcome {
					code: codes::OK,
					raw_log: String::new(),
					events: vec![receipt.event.to_chain_event()],
				})
			}
			Err(e) => {
				let code = match &e {
					FulfillmentError::OrderNotFound(_) => codes::ORDER_NOT_FOUND,
					FulfillmentError::AlreadyFulfilled(_) => codes::ALREADY_FULFILLED,
					FulfillmentError::Closed { .. } => codes::ORDER_CLOSED,
					FulfillmentError::InsufficientFunds(_) => codes::INSUFFICIENT_FUNDS,
					FulfillmentError::ModuleAccount(_) => codes::UNAUTHORIZED,
					FulfillmentError::Bank(_) | FulfillmentError::Ledger(_) => codes::INTERNAL,
				};
				self.event_bus
					.publish(EngineEvent::Order(OrderEvent::FulfillmentRejected {
						order_id: order_id.to_string(),
						reason: e.to_string(),
					}));
				Ok(TxOutcome::failed(code, e))
			}
		}
	}

	/// Advances held forwards and finality to hub height `height`.
	#[instrument(skip(self))]
	pub async fn on_block(&self, height: Height) -> BlockReport {
		self.height.fetch_max(height, Ordering::SeqCst);

		let forwards = self.forwarding.tick(height).await;
		for (id, packet) in &forwards.sent {
			self.event_bus.publish(EngineEvent::Forward(ForwardEvent::Sent {
				id: id.clone(),
				packet: packet.clone(),
			}));
		}
		for (id, error) in &forwards.retrying {
			self.event_bus
				.publish(EngineEvent::Forward(ForwardEvent::AttemptFailed {
					id: id.clone(),
					error: error.clone(),
				}));
		}
		for (id, error) in &forwards.failed {
			self.event_bus.publish(EngineEvent::Forward(ForwardEvent::Failed {
				id: id.clone(),
				error: error.clone(),
			}));
		}

		let finalization = self.finalization.process().await;
		for order in &finalization.finalized_orders {
			self.event_bus.publish(EngineEvent::Order(OrderEvent::Finalized {
				order: order.clone(),
			}));
		}
		for packet in &finalization.released_packets {
			self.event_bus.publish(EngineEvent::Packet(PacketEvent::Released {
				packet_id: packet.packet_id.clone(),
				receiver: packet.receiver.clone(),
			}));
		}

		BlockReport {
			height,
			forwards,
			finalization,
		}
	}

	/// Settles one order now if its height is final.
	pub async fn finalize_order(&self, order_id: &str) -> Result<DemandOrder, CoreError> {
		let outcome = self.finalization.on_finalized(order_id).await?;
		let order = match outcome {
			FinalizationOutcome::Settled { order, .. } => {
				self.event_bus.publish(EngineEvent::Order(OrderEvent::Finalized {
					order: order.clone(),
				}));
				order
			}
			FinalizationOutcome::AlreadyFinalized(order) => order,
		};
		Ok(order)
	}

	/// Rolls back everything unsettled from `rollapp_id` at or above
	/// `from_height`.
	#[instrument(skip(self))]
	pub async fn revert_rollapp(
		&self,
		rollapp_id: &str,
		from_height: Height,
	) -> Result<RevertReport, CoreError> {
		let previous: HashMap<_, _> = self
			.ledger
			.pending_for(rollapp_id)
			.await
			.into_iter()
			.map(|order| (order.id, order.status))
			.collect();
		let mut report = self.finalization.revert_from(rollapp_id, from_height).await?;
		report.reverted_forwards = self.forwarding.revert(rollapp_id, from_height).await?;
		for order_id in &report.reverted_orders {
			if let Some(status) = previous.get(order_id) {
				self.event_bus.publish(EngineEvent::Order(OrderEvent::Reverted {
					order_id: order_id.clone(),
					previous: *status,
				}));
			}
		}
		for packet_id in &report.reverted_packets {
			self.event_bus.publish(EngineEvent::Packet(PacketEvent::Reverted {
				packet_id: packet_id.clone(),
			}));
		}
		for id in &report.reverted_forwards {
			self.event_bus
				.publish(EngineEvent::Forward(ForwardEvent::Reverted { id: id.clone() }));
		}
		info!(
			rollapp = %rollapp_id,
			from_height,
			orders = report.reverted_orders.len(),
			packets = report.reverted_packets.len(),
			forwards = report.reverted_forwards.len(),
			"Rollapp state reverted"
		);
		Ok(report)
	}

	/// Cancels a held forward; its funds go to the intermediate receiver.
	pub async fn cancel_forward(&self, id: &str) -> Result<ForwardInstruction, CoreError> {
		let instruction = self
			.forwarding
			.get(id)
			.ok_or_else(|| CoreError::NotFound(format!("forward {}", id)))?;
		let handle = ForwardHandle {
			id: instruction.id().to_string(),
			hold_until: instruction.hold_until,
		};
		let cancelled = self.forwarding.cancel(&handle).await?;
		self.event_bus.publish(EngineEvent::Forward(ForwardEvent::Cancelled {
			id: id.to_string(),
		}));
		Ok(cancelled)
	}

	pub async fn order(&self, id: &str) -> Result<DemandOrder, CoreError> {
		Ok(self.ledger.lookup(id).await?)
	}

	pub async fn orders(&self, filter: &OrderFilter) -> Vec<DemandOrder> {
		self.ledger.list(filter).await
	}

	pub async fn stats(&self) -> LedgerStats {
		self.ledger.stats().await
	}

	pub fn forward(&self, id: &str) -> Option<ForwardInstruction> {
		self.forwarding.get(id)
	}

	pub fn forwards(&self) -> Vec<ForwardInstruction> {
		self.forwarding.list()
	}

	pub fn packet(&self, packet_id: &str) -> Option<PendingPacket> {
		self.finalization.packet(packet_id)
	}

	pub fn pending_packets(&self) -> Vec<PendingPacket> {
		self.finalization.pending_packets()
	}

	async fn receive_direct(
		&self,
		transfer: InboundTransfer,
		trace: DenomTrace,
		hub_height: Height,
	) -> Result<RecvOutcome, CoreError> {
		if let MemoResult::Parsed(ParsedMemo {
			forward: Some(forward),
			..
		}) = eibc_memo::parse(&transfer.memo)
		{
			let source = transfer.source_chain.clone();
			let handle = self
				.schedule_forward(&transfer, &source, forward, hub_height, 0)
				.await?;
			return Ok(RecvOutcome::ForwardScheduled { handle });
		}

		let denom = trace.ibc_denom();
		self.bank
			.mint(&transfer.receiver, &denom, transfer.amount)
			.await?;
		debug!(receiver = %transfer.receiver, denom = %denom, "Credited non-rollapp transfer");
		self.event_bus.publish(EngineEvent::Packet(PacketEvent::Credited {
			packet_id: transfer.packet_id(),
			receiver: transfer.receiver.clone(),
			amount: transfer.amount,
		}));
		Ok(RecvOutcome::Credited {
			receiver: transfer.receiver,
			denom,
		})
	}

	async fn schedule_forward(
		&self,
		transfer: &InboundTransfer,
		source: &str,
		forward: ForwardMemo,
		hub_height: Height,
		grace_period_blocks: Height,
	) -> Result<ForwardHandle, CoreError> {
		let request = ForwardRequest {
			id: transfer.packet_id(),
			source: source.to_string(),
			source_height: transfer.source_height,
			intermediate_receiver: transfer.receiver.clone(),
			receiver: forward.receiver,
			next_port: forward.port,
			next_channel: forward.channel,
			timeout: forward.timeout,
			retries: forward.retries,
			next_memo: forward.next,
			denom_trace: transfer.hub_denom_trace(),
			amount: transfer.amount,
		};
		let handle = self
			.forwarding
			.schedule(request, hub_height, grace_period_blocks)
			.await?;
		if let Some(instruction) = self.forwarding.get(&handle.id) {
			self.event_bus
				.publish(EngineEvent::Forward(ForwardEvent::Scheduled { instruction }));
		}
		Ok(handle)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use eibc_memo::build_eibc_memo;
	use eibc_state::MemoryBank;
	use eibc_types::{EibcError, OrderStatus, PacketHandle, ESCROW_ACCOUNT, TRANSFER_PORT};
	use std::sync::Mutex;
	use tokio::sync::RwLock;

	const ROLLAPP: &str = "rollappevm_1234-1";
	const RECEIVER: &str = "dym1receiver";
	const MARKET_MAKER: &str = "dym1marketmaker";

	#[derive(Default)]
	struct TestOracle {
		finalized: RwLock<HashMap<String, Height>>,
	}

	impl TestOracle {
		async fn finalize_up_to(&self, rollapp_id: &str, height: Height) {
			self.finalized
				.write()
				.await
				.insert(rollapp_id.to_string(), height);
		}
	}

	#[async_trait]
	impl FinalityOracle for TestOracle {
		async fn is_height_finalized(
			&self,
			rollapp_id: &str,
			height: Height,
		) -> eibc_types::Result<bool> {
			Ok(self
				.finalized
				.read()
				.await
				.get(rollapp_id)
				.map_or(false, |finalized| height <= *finalized))
		}
	}

	/// Takes forwarded funds out of hub escrow and records the send.
	struct EscrowTransport {
		bank: Arc<MemoryBank>,
		sent: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl ForwardTransport for EscrowTransport {
		async fn send(&self, instruction: &ForwardInstruction) -> eibc_types::Result<PacketHandle> {
			let request = &instruction.request;
			self.bank
				.burn(ESCROW_ACCOUNT, &request.denom_trace.ibc_denom(), request.amount)
				.await
				.map_err(EibcError::from)?;
			let mut sent = self.sent.lock().unwrap();
			sent.push(request.id.clone());
			Ok(PacketHandle {
				source_port: request.next_port.clone(),
				source_channel: request.next_channel.clone(),
				sequence: sent.len() as u64,
			})
		}
	}

	struct Harness {
		bank: Arc<MemoryBank>,
		oracle: Arc<TestOracle>,
		transport: Arc<EscrowTransport>,
		engine: EibcEngine,
	}

	fn harness() -> Harness {
		let bank = Arc::new(MemoryBank::new());
		let oracle = Arc::new(TestOracle::default());
		let transport = Arc::new(EscrowTransport {
			bank: bank.clone(),
			sent: Mutex::new(Vec::new()),
		});
		let config = EngineConfig {
			routes: vec![RollappRoute {
				rollapp_id: ROLLAPP.to_string(),
				hub_channel: "channel-0".to_string(),
				dispute_period_in_blocks: 100,
			}],
			..Default::default()
		};
		let engine = EibcEngine::new(config, bank.clone(), oracle.clone(), transport.clone());
		Harness {
			bank,
			oracle,
			transport,
			engine,
		}
	}

	fn transfer(sequence: u64, dest_channel: &str, amount: u128, memo: &str) -> InboundTransfer {
		InboundTransfer {
			sequence,
			source_port: TRANSFER_PORT.to_string(),
			source_channel: "channel-0".to_string(),
			dest_port: TRANSFER_PORT.to_string(),
			dest_channel: dest_channel.to_string(),
			source_chain: ROLLAPP.to_string(),
			source_height: 10,
			denom: "urax".to_string(),
			amount,
			sender: "ethm1sender".to_string(),
			receiver: RECEIVER.to_string(),
			memo: memo.to_string(),
		}
	}

	fn voucher() -> String {
		transfer(0, "channel-0", 1, "").hub_denom_trace().ibc_denom()
	}

	async fn create_order(h: &Harness, sequence: u64) -> DemandOrder {
		match h
			.engine
			.on_recv_packet(transfer(sequence, "channel-0", 1_000, &build_eibc_memo(10)), 5)
			.await
			.unwrap()
		{
			RecvOutcome::OrderCreated { order } => order,
			other => panic!("expected an order, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_fulfill_then_finalize_pays_fulfiller() {
		let h = harness();
		let denom = voucher();
		h.bank.mint(MARKET_MAKER, &denom, 5_000).await.unwrap();

		let order = create_order(&h, 1).await;
		assert_eq!(order.price, 990);
		assert_eq!(h.bank.balance(RECEIVER, &denom).await, 0);

		let tx = h.engine.fulfill(&order.id, MARKET_MAKER).await.unwrap();
		assert!(tx.is_success());
		assert_eq!(tx.events.len(), 1);
		assert_eq!(tx.events[0].attribute("is_fulfilled"), Some("true"));
		assert_eq!(h.bank.balance(RECEIVER, &denom).await, 990);

		assert!(h.engine.on_block(6).await.finalization.is_empty());

		h.oracle.finalize_up_to(ROLLAPP, 10).await;
		let report = h.engine.on_block(7).await;
		assert_eq!(report.finalization.finalized_orders.len(), 1);
		let events = report.chain_events();
		assert_eq!(events[0].attribute("packet_status"), Some("FINALIZED"));

		assert_eq!(h.bank.balance(MARKET_MAKER, &denom).await, 5_000 - 990 + 1_000);
		assert_eq!(h.bank.balance(ESCROW_ACCOUNT, &denom).await, 0);
		assert_eq!(
			h.engine.order(&order.id).await.unwrap().status,
			OrderStatus::Finalized
		);
	}

	#[tokio::test]
	async fn test_rejected_fulfillments_carry_codes() {
		let h = harness();
		let denom = voucher();
		h.bank.mint(MARKET_MAKER, &denom, 5_000).await.unwrap();
		let order = create_order(&h, 1).await;

		let broke = h.engine.fulfill(&order.id, "dym1broke").await.unwrap();
		assert_eq!(broke.code, codes::INSUFFICIENT_FUNDS);
		assert!(broke.raw_log.contains("insufficient funds"));
		assert!(broke.events.is_empty());

		assert!(h.engine.fulfill(&order.id, MARKET_MAKER).await.unwrap().is_success());
		let again = h.engine.fulfill(&order.id, MARKET_MAKER).await.unwrap();
		assert_eq!(again.code, codes::ALREADY_FULFILLED);

		let missing = h.engine.fulfill("deadbeef", MARKET_MAKER).await.unwrap();
		assert_eq!(missing.code, codes::ORDER_NOT_FOUND);

		assert!(matches!(
			h.engine.fulfill("", MARKET_MAKER).await,
			Err(CoreError::InvalidRequest(_))
		));
	}

	#[tokio::test]
	async fn test_unusable_memos_hold_until_finality() {
		let h = harness();
		let denom = voucher();
		let memos = [
			"",
			"{\"eibc\":{\"fee\":\"abc\"}}",
			"{\"eibc\":",
			"{\"eibc\":{\"fee\":\"2000\"}}",
		];
		for (seq, memo) in memos.iter().enumerate() {
			let outcome = h
				.engine
				.on_recv_packet(transfer(seq as u64, "channel-0", 1_000, memo), 5)
				.await
				.unwrap();
			assert!(matches!(outcome, RecvOutcome::Held { .. }), "memo {:?}", memo);
			assert!(outcome.chain_events().is_empty());
		}

		assert_eq!(h.engine.stats().await.total, 0);
		assert_eq!(h.engine.pending_packets().len(), 4);
		assert_eq!(h.bank.balance(RECEIVER, &denom).await, 0);

		h.oracle.finalize_up_to(ROLLAPP, 10).await;
		let report = h.engine.on_block(6).await;
		assert_eq!(report.finalization.released_packets.len(), 4);
		assert_eq!(h.bank.balance(RECEIVER, &denom).await, 4_000);
	}

	#[tokio::test]
	async fn test_duplicate_packet_changes_nothing() {
		let h = harness();
		let order = create_order(&h, 1).await;
		let outcome = h
			.engine
			.on_recv_packet(transfer(1, "channel-0", 1_000, &build_eibc_memo(10)), 6)
			.await
			.unwrap();
		assert_eq!(
			outcome,
			RecvOutcome::Duplicate {
				packet_id: order.id.clone()
			}
		);
		assert_eq!(h.bank.balance(ESCROW_ACCOUNT, &voucher()).await, 1_000);
	}

	#[tokio::test]
	async fn test_redelivery_with_different_memo_is_duplicate() {
		let h = harness();
		let order = create_order(&h, 1).await;

		let outcome = h
			.engine
			.on_recv_packet(transfer(1, "channel-0", 1_000, ""), 6)
			.await
			.unwrap();
		assert_eq!(
			outcome,
			RecvOutcome::Duplicate {
				packet_id: order.id.clone()
			}
		);
		assert_eq!(h.bank.balance(ESCROW_ACCOUNT, &voucher()).await, 1_000);
		assert!(h.engine.pending_packets().is_empty());
	}

	#[tokio::test]
	async fn test_non_rollapp_redelivery_credits_once() {
		let h = harness();
		let packet = transfer(1, "channel-9", 700, "");
		let denom = packet.hub_denom_trace().ibc_denom();

		let first = h.engine.on_recv_packet(packet.clone(), 5).await.unwrap();
		assert!(matches!(first, RecvOutcome::Credited { .. }));
		let second = h.engine.on_recv_packet(packet, 6).await.unwrap();
		assert!(matches!(second, RecvOutcome::Duplicate { .. }));
		assert_eq!(h.bank.balance(RECEIVER, &denom).await, 700);
	}

	#[tokio::test]
	async fn test_rejected_packet_may_be_delivered_again() {
		let h = harness();
		assert!(h
			.engine
			.on_recv_packet(transfer(1, "channel-9", 0, ""), 5)
			.await
			.is_err());
		let outcome = h
			.engine
			.on_recv_packet(transfer(1, "channel-9", 700, ""), 5)
			.await
			.unwrap();
		assert!(matches!(outcome, RecvOutcome::Credited { .. }));
	}

	#[tokio::test]
	async fn test_non_rollapp_transfer_is_credited() {
		let h = harness();
		let packet = transfer(1, "channel-9", 700, &build_eibc_memo(10));
		let denom = packet.hub_denom_trace().ibc_denom();

		let outcome = h.engine.on_recv_packet(packet, 5).await.unwrap();
		assert!(matches!(outcome, RecvOutcome::Credited { .. }));
		assert_eq!(h.bank.balance(RECEIVER, &denom).await, 700);
		assert_eq!(h.engine.stats().await.total, 0);
	}

	#[tokio::test]
	async fn test_forward_waits_for_dispute_period() {
		let h = harness();
		let memo = ForwardMemo::new("cosmos1dest", "channel-1").to_memo();
		let outcome = h
			.engine
			.on_recv_packet(transfer(1, "channel-0", 1_000, &memo), 20)
			.await
			.unwrap();
		let handle = match outcome {
			RecvOutcome::ForwardScheduled { handle } => handle,
			other => panic!("expected a forward, got {:?}", other),
		};
		assert_eq!(handle.hold_until, 120);

		assert!(h.engine.on_block(70).await.forwards.is_empty());
		assert!(h.transport.sent.lock().unwrap().is_empty());
		assert_eq!(h.bank.balance(ESCROW_ACCOUNT, &voucher()).await, 1_000);

		let report = h.engine.on_block(120).await;
		assert_eq!(report.forwards.sent.len(), 1);
		assert_eq!(h.bank.balance(ESCROW_ACCOUNT, &voucher()).await, 0);
		assert_eq!(h.bank.balance(RECEIVER, &voucher()).await, 0);
	}

	#[tokio::test]
	async fn test_cancel_forward_pays_intermediate_receiver() {
		let h = harness();
		let memo = ForwardMemo::new("cosmos1dest", "channel-1").to_memo();
		h.engine
			.on_recv_packet(transfer(1, "channel-0", 1_000, &memo), 20)
			.await
			.unwrap();
		let id = h.engine.forwards()[0].id().to_string();

		h.engine.cancel_forward(&id).await.unwrap();
		assert_eq!(h.bank.balance(RECEIVER, &voucher()).await, 1_000);
		assert!(h.engine.on_block(200).await.forwards.is_empty());
		assert!(matches!(
			h.engine.cancel_forward("unknown").await,
			Err(CoreError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn test_revert_burns_escrow_and_publishes() {
		let h = harness();
		let mut events = h.engine.event_bus().subscribe();
		let order = create_order(&h, 1).await;
		h.engine
			.on_recv_packet(transfer(2, "channel-0", 500, ""), 5)
			.await
			.unwrap();

		let report = h.engine.revert_rollapp(ROLLAPP, 10).await.unwrap();
		assert_eq!(report.reverted_orders, vec![order.id.clone()]);
		assert_eq!(report.reverted_packets.len(), 1);
		assert_eq!(h.bank.balance(ESCROW_ACCOUNT, &voucher()).await, 0);

		let mut saw_revert = false;
		while let Ok(event) = events.try_recv() {
			if let EngineEvent::Order(OrderEvent::Reverted { order_id, previous }) = event {
				assert_eq!(order_id, order.id);
				assert_eq!(previous, OrderStatus::Pending);
				saw_revert = true;
			}
		}
		assert!(saw_revert);
	}

	#[tokio::test]
	async fn test_concurrent_fulfillments_have_one_winner() {
		let h = Arc::new(harness());
		let denom = voucher();
		let order = create_order(&h, 1).await;
		for i in 0..8 {
			h.bank.mint(&format!("dym1mm{}", i), &denom, 990).await.unwrap();
		}

		let attempts = (0..8).map(|i| {
			let h = h.clone();
			let id = order.id.clone();
			async move { h.engine.fulfill(&id, &format!("dym1mm{}", i)).await.unwrap() }
		});
		let results = futures::future::join_all(attempts).await;

		assert_eq!(results.iter().filter(|tx| tx.is_success()).count(), 1);
		assert_eq!(h.bank.balance(RECEIVER, &denom).await, 990);
	}
}
