//! Service wiring: builds the local chains and the settlement engine from
//! configuration and runs the background tasks.

use chrono::{DateTime, Utc};
use eibc_chains::{CounterpartyChain, LocalHub, LocalRollapp, StateUpdate};
use eibc_config::EibcConfig;
use eibc_core::{EngineConfig, RecvOutcome, RollappRoute};
use eibc_discovery::{EibcEventWatcher, EventScanner, ObservedEibcEvent, ScanConfig};
use eibc_state::MemoryBank;
use eibc_types::{
	Amount, BankKeeper, ChainAdapter, ChainName, EibcError, Height, InboundTransfer, Result,
	TxResult, TRANSFER_PORT,
};
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

/// The hub with its rollapps and counterparty chains.
pub struct EibcService {
	config: EibcConfig,
	hub: Arc<LocalHub>,
	rollapps: HashMap<ChainName, Arc<LocalRollapp>>,
	counterparties: HashMap<ChainName, Arc<CounterpartyChain>>,
	scanner: EventScanner,
	watcher: EibcEventWatcher,
	/// Last hub height the event watcher has fully read.
	watched_to: AtomicU64,
	started_at: DateTime<Utc>,
}

impl EibcService {
	pub fn new(config: EibcConfig) -> Self {
		let hub = Arc::new(LocalHub::new(
			config.hub.chain_id.clone(),
			Self::engine_config(&config),
		));

		let rollapps = config
			.rollapps
			.iter()
			.map(|(chain_id, rollapp)| {
				let local = LocalRollapp::new(
					chain_id.clone(),
					rollapp.rollapp_channel.clone(),
					rollapp.hub_channel.clone(),
					rollapp.denom.clone(),
				);
				(chain_id.clone(), Arc::new(local))
			})
			.collect();

		let counterparties = config
			.counterparties
			.iter()
			.map(|(chain_id, counterparty)| {
				let chain = Arc::new(CounterpartyChain {
					chain_id: chain_id.clone(),
					port: TRANSFER_PORT.to_string(),
					channel: counterparty.channel.clone(),
					bank: Arc::new(MemoryBank::new()),
				});
				hub.connect(&counterparty.hub_channel, chain.clone());
				(chain_id.clone(), chain)
			})
			.collect();

		let adapter: Arc<dyn ChainAdapter> = hub.clone();
		let scanner = EventScanner::new(
			adapter,
			ScanConfig {
				max_retries: config.scanner.max_retries,
				initial_backoff: Duration::from_millis(config.scanner.initial_backoff_ms),
				max_backoff: Duration::from_millis(config.scanner.max_backoff_ms),
				// Only committed heights are ever requested.
				wait_for_blocks: false,
			},
		);
		let watcher = EibcEventWatcher::new(scanner.clone());

		Self {
			config,
			hub,
			rollapps,
			counterparties,
			scanner,
			watcher,
			watched_to: AtomicU64::new(0),
			started_at: Utc::now(),
		}
	}

	/// One route per configured rollapp.
	pub fn engine_config(config: &EibcConfig) -> EngineConfig {
		EngineConfig {
			routes: config
				.rollapps
				.iter()
				.map(|(chain_id, rollapp)| RollappRoute {
					rollapp_id: chain_id.clone(),
					hub_channel: rollapp.hub_channel.clone(),
					dispute_period_in_blocks: rollapp.dispute_period_in_blocks,
				})
				.collect(),
			retry_interval_blocks: config.forwarding.retry_interval_blocks,
			event_capacity: config.api.event_capacity,
		}
	}

	pub fn config(&self) -> &EibcConfig {
		&self.config
	}

	pub fn hub(&self) -> &Arc<LocalHub> {
		&self.hub
	}

	pub fn rollapp(&self, chain_id: &str) -> Result<&Arc<LocalRollapp>> {
		self.rollapps
			.get(chain_id)
			.ok_or_else(|| EibcError::NotFound(format!("rollapp {}", chain_id)))
	}

	pub fn counterparty(&self, chain_id: &str) -> Result<&Arc<CounterpartyChain>> {
		self.counterparties
			.get(chain_id)
			.ok_or_else(|| EibcError::NotFound(format!("counterparty {}", chain_id)))
	}

	pub fn scanner(&self) -> &EventScanner {
		&self.scanner
	}

	pub fn watcher(&self) -> &EibcEventWatcher {
		&self.watcher
	}

	pub fn started_at(&self) -> DateTime<Utc> {
		self.started_at
	}

	/// Starts the engine, block production and the event watcher.
	pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
		let engine = self.hub.engine();
		engine.start().await?;

		let blocks = tokio::spawn(
			self.hub
				.clone()
				.run(self.config.hub.block_time(), engine.lifecycle().subscribe_shutdown()),
		);
		let events = tokio::spawn(self.clone().watch_events(
			self.config.finalization.poll_interval(),
			engine.lifecycle().subscribe_shutdown(),
		));

		info!(
			hub = %self.config.hub.chain_id,
			rollapps = self.rollapps.len(),
			counterparties = self.counterparties.len(),
			"Service started"
		);
		Ok(vec![blocks, events])
	}

	pub async fn shutdown(&self) -> Result<()> {
		self.hub.engine().shutdown().await?;
		Ok(())
	}

	/// Escrows `amount` on the rollapp and delivers the packet to the hub,
	/// the way a relayer would.
	pub async fn send_from_rollapp(
		&self,
		rollapp_id: &str,
		sender: &str,
		receiver: &str,
		amount: Amount,
		memo: &str,
	) -> Result<(InboundTransfer, RecvOutcome, TxResult)> {
		let rollapp = self.rollapp(rollapp_id)?;
		let transfer = rollapp.send_transfer(sender, receiver, amount, memo).await?;
		let (outcome, tx) = self.hub.deliver_packet(transfer.clone()).await?;
		Ok((transfer, outcome, tx))
	}

	/// Posts a state update covering the rollapp up to its current height.
	pub async fn submit_state_update(&self, rollapp_id: &str) -> Result<StateUpdate> {
		let rollapp = self.rollapp(rollapp_id)?;
		self.hub
			.submit_state_update(rollapp_id, rollapp.height())
			.await
	}

	/// Credits `amount` of `denom` to `address` on the hub.
	pub async fn faucet(&self, address: &str, denom: &str, amount: Amount) -> Result<()> {
		self.hub.bank().mint(address, denom, amount).await?;
		Ok(())
	}

	/// Credits the rollapp's native denom to `address` on the rollapp.
	pub async fn rollapp_faucet(&self, rollapp_id: &str, address: &str, amount: Amount) -> Result<()> {
		let rollapp = self.rollapp(rollapp_id)?;
		rollapp.bank().mint(address, rollapp.denom(), amount).await?;
		Ok(())
	}

	/// Reports `eibc` events committed since the last poll. Heights that
	/// could not be read are polled again next time.
	pub async fn poll_events(&self) -> Vec<ObservedEibcEvent> {
		let from = self.watched_to.load(Ordering::SeqCst) + 1;
		let to = self.hub.current_height().await;
		if from > to {
			return Vec::new();
		}

		let (events, errors) = self.watcher.poll(from..=to).await;
		let watched_to = match errors.iter().map(|e| e.height()).min() {
			Some(failed) => {
				warn!(height = failed, failures = errors.len(), "Event scan incomplete");
				failed - 1
			}
			None => to,
		};
		let watched_to = watched_to.max(from - 1);
		self.watched_to.store(watched_to, Ordering::SeqCst);
		self.watcher.prune_below(watched_to + 1);
		events
	}

	async fn watch_events(self: Arc<Self>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
		let mut interval = tokio::time::interval(every);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = interval.tick() => {
					for observed in self.poll_events().await {
						info!(
							height = observed.height,
							tx = %observed.tx_hash,
							order_id = %observed.event.id,
							packet_status = %observed.event.packet_status,
							is_fulfilled = observed.event.is_fulfilled,
							"eibc event"
						);
					}
				}
				_ = shutdown.recv() => break,
			}
		}
	}

	/// Last hub height fully read by the event watcher.
	pub fn watched_height(&self) -> Height {
		self.watched_to.load(Ordering::SeqCst)
	}
}
