//! The hub: runs the settlement engine and indexes its transactions.

use super::{
	finality::{RollappFinality, StateUpdate},
	transport::{CounterpartyChain, LocalForwardTransport},
};
use async_trait::async_trait;
use dashmap::DashMap;
use eibc_core::{BlockReport, EibcEngine, EngineConfig, RecvOutcome, RevertReport, TxOutcome};
use eibc_state::MemoryBank;
use eibc_types::{
	Amount, BankKeeper, ChainAdapter, ChainEvent, EibcError, FinalityOracle, ForwardInstruction,
	Height, InboundTransfer, PacketHandle, Result, TransferRequest, TxHash, TxResult,
};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, instrument, warn};

struct ChainState {
	height: Height,
	/// Committed blocks plus the one being built at `height + 1`.
	blocks: BTreeMap<Height, Vec<TxResult>>,
}

/// In-process hub chain.
///
/// Transactions execute against the engine immediately and are included in
/// the block being built; [`LocalHub::advance_block`] commits it, advances
/// rollapp finality and lets the engine process the new height.
pub struct LocalHub {
	chain_id: String,
	engine: Arc<EibcEngine>,
	bank: Arc<MemoryBank>,
	finality: Arc<RollappFinality>,
	transport: Arc<LocalForwardTransport>,
	state: RwLock<ChainState>,
	txs: DashMap<TxHash, TxResult>,
	read_faults: DashMap<Height, u32>,
	height_tx: watch::Sender<Height>,
}

impl LocalHub {
	/// Creates a hub at height 0 with one registered rollapp per route.
	pub fn new(chain_id: impl Into<String>, config: EngineConfig) -> Self {
		let bank = Arc::new(MemoryBank::new());
		let finality = Arc::new(RollappFinality::new());
		for route in &config.routes {
			finality.register(&route.rollapp_id, route.dispute_period_in_blocks);
		}
		let transport = Arc::new(LocalForwardTransport::new(bank.clone()));
		let oracle: Arc<dyn FinalityOracle> = finality.clone();
		let engine = Arc::new(EibcEngine::new(config, bank.clone(), oracle, transport.clone()));
		let (height_tx, _) = watch::channel(0);

		Self {
			chain_id: chain_id.into(),
			engine,
			bank,
			finality,
			transport,
			state: RwLock::new(ChainState {
				height: 0,
				blocks: BTreeMap::new(),
			}),
			txs: DashMap::new(),
			read_faults: DashMap::new(),
			height_tx,
		}
	}

	pub fn engine(&self) -> &Arc<EibcEngine> {
		&self.engine
	}

	pub fn bank(&self) -> &Arc<MemoryBank> {
		&self.bank
	}

	pub fn finality(&self) -> &Arc<RollappFinality> {
		&self.finality
	}

	pub fn transport(&self) -> &Arc<LocalForwardTransport> {
		&self.transport
	}

	pub fn connect(&self, hub_channel: &str, counterparty: Arc<CounterpartyChain>) {
		self.transport.connect(hub_channel, counterparty);
	}

	pub fn subscribe_heights(&self) -> watch::Receiver<Height> {
		self.height_tx.subscribe()
	}

	pub async fn current_height(&self) -> Height {
		self.state.read().await.height
	}

	/// The next `times` reads of `height` fail transiently.
	pub fn fail_reads(&self, height: Height, times: u32) {
		self.read_faults.insert(height, times);
	}

	/// Delivers an inbound transfer packet.
	#[instrument(skip(self, transfer), fields(sequence = transfer.sequence))]
	pub async fn deliver_packet(
		&self,
		transfer: InboundTransfer,
	) -> Result<(RecvOutcome, TxResult)> {
		let height = self.current_height().await + 1;
		let outcome = self.engine.on_recv_packet(transfer, height).await?;
		let tx = self
			.include(
				"recv_packet",
				TxOutcome {
					code: 0,
					raw_log: String::new(),
					events: outcome.chain_events(),
				},
			)
			.await;
		Ok((outcome, tx))
	}

	/// Submits a fulfillment. Execution failures are in the returned
	/// result's `code` and `raw_log`.
	pub async fn fulfill(&self, order_id: &str, fulfiller: &str) -> Result<TxResult> {
		let outcome = self.engine.fulfill(order_id, fulfiller).await?;
		if !outcome.is_success() {
			debug!(order_id, code = outcome.code, "Fulfillment failed");
		}
		Ok(self.include("fulfill_order", outcome).await)
	}

	pub async fn submit_state_update(
		&self,
		rollapp_id: &str,
		end_height: Height,
	) -> Result<StateUpdate> {
		Ok(self.finality.submit_state_update(rollapp_id, end_height)?)
	}

	/// Reverts a rollapp from `from_height` on: drops its pending state
	/// updates and rolls back everything the engine holds for it.
	pub async fn revert_rollapp(&self, rollapp_id: &str, from_height: Height) -> Result<RevertReport> {
		self.finality.revert(rollapp_id, from_height)?;
		Ok(self.engine.revert_rollapp(rollapp_id, from_height).await?)
	}

	pub async fn cancel_forward(&self, id: &str) -> Result<ForwardInstruction> {
		Ok(self.engine.cancel_forward(id).await?)
	}

	/// Commits the block being built and processes the new height.
	pub async fn advance_block(&self) -> BlockReport {
		let mut state = self.state.write().await;
		let height = state.height + 1;

		self.finality.on_hub_block(height);
		let report = self.engine.on_block(height).await;

		let events = report.chain_events();
		if !events.is_empty() {
			let tx = self.record(&mut state, height, "end_block", 0, String::new(), events);
			debug!(height, tx = %tx.hash, "End-block events recorded");
		}
		state.blocks.entry(height).or_default();
		state.height = height;
		drop(state);

		self.height_tx.send_replace(height);
		report
	}

	pub async fn advance_blocks(&self, count: u64) -> Height {
		for _ in 0..count {
			self.advance_block().await;
		}
		self.current_height().await
	}

	/// Produces a block every `block_time` until shutdown is signalled.
	pub async fn run(self: Arc<Self>, block_time: Duration, mut shutdown: broadcast::Receiver<()>) {
		let mut interval = tokio::time::interval(block_time);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		info!(chain = %self.chain_id, ?block_time, "Block production started");

		loop {
			tokio::select! {
				_ = interval.tick() => {
					let report = self.advance_block().await;
					if !report.forwards.is_empty() || !report.finalization.is_empty() {
						info!(
							height = report.height,
							forwards_sent = report.forwards.sent.len(),
							orders_finalized = report.finalization.finalized_orders.len(),
							packets_released = report.finalization.released_packets.len(),
							"Block processed"
						);
					}
				}
				_ = shutdown.recv() => {
					info!(chain = %self.chain_id, "Block production stopped");
					break;
				}
			}
		}
	}

	async fn include(&self, label: &str, outcome: TxOutcome) -> TxResult {
		let mut state = self.state.write().await;
		let height = state.height + 1;
		self.record(
			&mut state,
			height,
			label,
			outcome.code,
			outcome.raw_log,
			outcome.events,
		)
	}

	fn record(
		&self,
		state: &mut ChainState,
		height: Height,
		label: &str,
		code: u32,
		raw_log: String,
		events: Vec<ChainEvent>,
	) -> TxResult {
		let block = state.blocks.entry(height).or_default();
		let preimage = format!("{}/{}/{}/{}", self.chain_id, height, block.len(), label);
		let tx = TxResult {
			hash: hex::encode_upper(Sha256::digest(preimage.as_bytes())),
			height,
			code,
			raw_log,
			events,
		};
		block.push(tx.clone());
		self.txs.insert(tx.hash.clone(), tx.clone());
		tx
	}
}

#[async_trait]
impl ChainAdapter for LocalHub {
	fn chain_id(&self) -> &str {
		&self.chain_id
	}

	async fn height(&self) -> Result<Height> {
		Ok(self.current_height().await)
	}

	async fn query_balance(&self, address: &str, denom: &str) -> Result<Amount> {
		Ok(self.bank.balance(address, denom).await)
	}

	async fn submit_transfer(&self, request: TransferRequest) -> Result<PacketHandle> {
		let packet = self.transport.transfer(&request).await?;
		self.include(
			"transfer",
			TxOutcome {
				code: 0,
				raw_log: String::new(),
				events: vec![ChainEvent::new("send_packet")
					.with_attribute("packet_src_port", &packet.source_port)
					.with_attribute("packet_src_channel", &packet.source_channel)
					.with_attribute("packet_sequence", packet.sequence)],
			},
		)
		.await;
		Ok(packet)
	}

	async fn wait_for_height(&self, height: Height) -> Result<()> {
		let mut heights = self.height_tx.subscribe();
		heights
			.wait_for(|current| *current >= height)
			.await
			.map_err(|_| EibcError::Chain("hub stopped producing blocks".into()))?;
		Ok(())
	}

	async fn txs_at(&self, height: Height) -> Result<Vec<TxResult>> {
		if let Some(mut left) = self.read_faults.get_mut(&height) {
			if *left > 0 {
				*left -= 1;
				warn!(height, "Injected read failure");
				return Err(EibcError::TransientRead {
					height,
					reason: "node temporarily unavailable".into(),
				});
			}
		}

		let state = self.state.read().await;
		if height > state.height {
			return Err(EibcError::Chain(format!(
				"height {} is not committed yet (latest {})",
				height, state.height
			)));
		}
		Ok(state.blocks.get(&height).cloned().unwrap_or_default())
	}

	async fn is_height_finalized(&self, rollapp_id: &str, height: Height) -> Result<bool> {
		self.finality.is_height_finalized(rollapp_id, height).await
	}

	async fn get_transaction(&self, hash: &str) -> Result<Option<TxResult>> {
		let Some(tx) = self.txs.get(hash).map(|tx| tx.clone()) else {
			return Ok(None);
		};
		// Visible once its block is committed.
		if tx.height > self.current_height().await {
			return Ok(None);
		}
		Ok(Some(tx))
	}
}
