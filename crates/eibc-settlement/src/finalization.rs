//! Payout of escrowed funds once rollapp heights become final.
//!
//! Two kinds of items wait in escrow for finality: demand orders (owned by
//! the ledger) and ordinary transfers that carried no usable order
//! ([`PendingPacket`], owned here). Both are released strictly in height
//! order per rollapp: a height is only settled after every lower height of
//! the same rollapp has been.

use crate::FinalizationError;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use eibc_state::DemandOrderLedger;
use eibc_types::{
	Address, Amount, ChainAdapter, ChainName, DemandOrder, Denom, FinalityOracle, Height,
	InstructionId, OrderId, OrderFilter, OrderStatus, PacketStatus, ESCROW_ACCOUNT,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, instrument, warn};

/// An inbound rollapp transfer held in escrow until its height is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPacket {
	pub packet_id: String,
	pub rollapp_id: ChainName,
	pub source_height: Height,
	pub receiver: Address,
	pub denom: Denom,
	#[serde(with = "eibc_types::serde_helpers::amount")]
	pub amount: Amount,
	/// Why the packet did not become a demand order.
	pub reason: String,
	pub status: PacketStatus,
	pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizationOutcome {
	/// Escrow paid out to `recipient`.
	Settled { order: DemandOrder, recipient: Address },
	/// The order had been finalized before; nothing moved.
	AlreadyFinalized(DemandOrder),
}

/// What one pass of [`FinalizationMonitor::process`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationReport {
	pub finalized_orders: Vec<DemandOrder>,
	pub released_packets: Vec<PendingPacket>,
	/// Items left waiting for finality.
	pub deferred: usize,
}

impl FinalizationReport {
	pub fn is_empty(&self) -> bool {
		self.finalized_orders.is_empty() && self.released_packets.is_empty()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertReport {
	pub reverted_orders: Vec<OrderId>,
	pub reverted_packets: Vec<String>,
	/// Held forwards whose inbound packet was reverted. Filled in by the
	/// engine, which owns the forward controller.
	#[serde(default)]
	pub reverted_forwards: Vec<InstructionId>,
}

pub struct FinalizationMonitor {
	ledger: Arc<DemandOrderLedger>,
	oracle: Arc<dyn FinalityOracle>,
	packets: DashMap<String, PendingPacket>,
}

impl FinalizationMonitor {
	pub fn new(ledger: Arc<DemandOrderLedger>, oracle: Arc<dyn FinalityOracle>) -> Self {
		Self {
			ledger,
			oracle,
			packets: DashMap::new(),
		}
	}

	/// Settles one demand order whose rollapp height is final.
	///
	/// A pending order pays its full amount to the original receiver; a
	/// fulfilled one pays the fulfiller. Calling it again on a finalized
	/// order is a no-op.
	#[instrument(skip(self))]
	pub async fn on_finalized(
		&self,
		order_id: &str,
	) -> Result<FinalizationOutcome, FinalizationError> {
		let snapshot = self.ledger.lookup(order_id).await?;
		match snapshot.status {
			OrderStatus::Finalized => return Ok(FinalizationOutcome::AlreadyFinalized(snapshot)),
			OrderStatus::Reverted => return Err(FinalizationError::Reverted(snapshot.id)),
			OrderStatus::Pending | OrderStatus::Fulfilled => {}
		}
		// Rollapp and height never change, so the proof may be checked
		// before taking the lock.
		self.ensure_final(&snapshot.rollapp_id, snapshot.source_height)
			.await?;
		self.settle_order(order_id).await
	}

	/// Escrows an ordinary packet until its height is final.
	pub async fn track(&self, packet: PendingPacket) -> Result<(), FinalizationError> {
		match self.packets.entry(packet.packet_id.clone()) {
			Entry::Occupied(_) => return Err(FinalizationError::DuplicatePacket(packet.packet_id)),
			Entry::Vacant(vacant) => {
				vacant.insert(packet.clone());
			}
		}
		if let Err(e) = self
			.ledger
			.bank()
			.mint(ESCROW_ACCOUNT, &packet.denom, packet.amount)
			.await
		{
			self.packets.remove(&packet.packet_id);
			return Err(e.into());
		}

		debug!(
			packet_id = %packet.packet_id,
			rollapp = %packet.rollapp_id,
			height = packet.source_height,
			reason = %packet.reason,
			"Holding packet until finality"
		);
		Ok(())
	}

	pub fn packet(&self, packet_id: &str) -> Option<PendingPacket> {
		self.packets.get(packet_id).map(|p| p.clone())
	}

	/// Packets still waiting for finality.
	pub fn pending_packets(&self) -> Vec<PendingPacket> {
		let mut packets: Vec<_> = self
			.packets
			.iter()
			.filter(|p| p.status == PacketStatus::Pending)
			.map(|p| p.clone())
			.collect();
		packets.sort_by(|a, b| {
			(&a.rollapp_id, a.source_height, &a.packet_id).cmp(&(
				&b.rollapp_id,
				b.source_height,
				&b.packet_id,
			))
		});
		packets
	}

	/// Settles everything whose height is final, lowest height first per
	/// rollapp. The first height that is not provably final stops that
	/// rollapp's pass; its items are retried on the next call.
	pub async fn process(&self) -> FinalizationReport {
		let mut report = FinalizationReport::default();

		for (rollapp_id, heights) in self.unsettled_heights().await {
			let mut blocked = false;
			for (height, (orders, packets)) in heights {
				if blocked {
					report.deferred += orders.len() + packets.len();
					continue;
				}

				match self.oracle.is_height_finalized(&rollapp_id, height).await {
					Ok(true) => {}
					Ok(false) => {
						debug!(rollapp = %rollapp_id, height, "Height not final yet");
						blocked = true;
						report.deferred += orders.len() + packets.len();
						continue;
					}
					Err(e) => {
						warn!(rollapp = %rollapp_id, height, error = %e, "Finality check failed");
						blocked = true;
						report.deferred += orders.len() + packets.len();
						continue;
					}
				}

				for order_id in orders {
					match self.settle_order(&order_id).await {
						Ok(FinalizationOutcome::Settled { order, .. }) => {
							report.finalized_orders.push(order)
						}
						Ok(FinalizationOutcome::AlreadyFinalized(_)) => {}
						Err(FinalizationError::Reverted(_)) => {}
						Err(e) => {
							warn!(order_id = %order_id, error = %e, "Failed to finalize order");
							report.deferred += 1;
						}
					}
				}
				for packet_id in packets {
					match self.release_packet(&packet_id).await {
						Ok(Some(packet)) => report.released_packets.push(packet),
						Ok(None) => {}
						Err(e) => {
							warn!(packet_id = %packet_id, error = %e, "Failed to release packet");
							report.deferred += 1;
						}
					}
				}
			}
		}

		if !report.is_empty() {
			info!(
				orders = report.finalized_orders.len(),
				packets = report.released_packets.len(),
				deferred = report.deferred,
				"Finalization pass"
			);
		}
		report
	}

	/// Reverts every unsettled order and packet of `rollapp_id` at or above
	/// `from_height` and burns their escrow. Finalized items are untouched.
	#[instrument(skip(self))]
	pub async fn revert_from(
		&self,
		rollapp_id: &str,
		from_height: Height,
	) -> Result<RevertReport, FinalizationError> {
		let mut report = RevertReport::default();

		for candidate in self.ledger.pending_for(rollapp_id).await {
			if candidate.source_height < from_height {
				continue;
			}
			let mut order = self.ledger.lock(&candidate.id).await?;
			if order.status.is_terminal() {
				continue;
			}
			self.ledger
				.bank()
				.burn(ESCROW_ACCOUNT, &order.denom, order.amount)
				.await?;
			let previous = order.status;
			order.status = OrderStatus::Reverted;
			order.packet_status = PacketStatus::Reverted;
			order.updated_at = Utc::now();
			warn!(order_id = %order.id, %previous, "Demand order reverted");
			report.reverted_orders.push(order.id.clone());
		}

		let ids: Vec<String> = self
			.packets
			.iter()
			.filter(|p| p.rollapp_id == rollapp_id && p.source_height >= from_height)
			.map(|p| p.packet_id.clone())
			.collect();
		for packet_id in ids {
			let Some(packet) = self.transition_packet(&packet_id, PacketStatus::Reverted) else {
				continue;
			};
			if let Err(e) = self
				.ledger
				.bank()
				.burn(ESCROW_ACCOUNT, &packet.denom, packet.amount)
				.await
			{
				self.transition_packet_back(&packet_id);
				return Err(e.into());
			}
			warn!(packet_id = %packet_id, "Held packet reverted");
			report.reverted_packets.push(packet_id);
		}

		Ok(report)
	}

	/// Polls `adapter` block by block until `height` of `rollapp_id` is final
	/// or `timeout_blocks` blocks have passed. Returns the hub height at
	/// which finality was observed.
	pub async fn wait_until_finalized(
		adapter: &dyn ChainAdapter,
		rollapp_id: &str,
		height: Height,
		timeout_blocks: Height,
	) -> Result<Height, FinalizationError> {
		let oracle_error = |e: eibc_types::EibcError| FinalizationError::Oracle(e.to_string());
		let start = adapter.height().await.map_err(oracle_error)?;
		let deadline = start.saturating_add(timeout_blocks);

		let mut current = start;
		loop {
			if adapter
				.is_height_finalized(rollapp_id, height)
				.await
				.map_err(oracle_error)?
			{
				debug!(rollapp = %rollapp_id, height, at = current, "Height finalized");
				return Ok(current);
			}
			if current >= deadline {
				return Err(FinalizationError::Timeout {
					rollapp_id: rollapp_id.to_string(),
					height,
					blocks: timeout_blocks,
				});
			}
			current += 1;
			adapter.wait_for_height(current).await.map_err(oracle_error)?;
		}
	}

	async fn ensure_final(&self, rollapp_id: &str, height: Height) -> Result<(), FinalizationError> {
		let finalized = self
			.oracle
			.is_height_finalized(rollapp_id, height)
			.await
			.map_err(|e| FinalizationError::Oracle(e.to_string()))?;
		if finalized {
			Ok(())
		} else {
			Err(FinalizationError::FinalityNotProven {
				rollapp_id: rollapp_id.to_string(),
				height,
			})
		}
	}

	// Caller has established finality of the order's height.
	async fn settle_order(&self, order_id: &str) -> Result<FinalizationOutcome, FinalizationError> {
		let mut order = self.ledger.lock(order_id).await?;
		match order.status {
			OrderStatus::Finalized => return Ok(FinalizationOutcome::AlreadyFinalized(order.clone())),
			OrderStatus::Reverted => return Err(FinalizationError::Reverted(order.id.clone())),
			OrderStatus::Pending | OrderStatus::Fulfilled => {}
		}

		let recipient = order.finalization_recipient().to_string();
		self.ledger
			.bank()
			.send(ESCROW_ACCOUNT, &recipient, &order.denom, order.amount)
			.await?;

		order.status = OrderStatus::Finalized;
		order.packet_status = PacketStatus::Finalized;
		order.updated_at = Utc::now();

		info!(
			order_id = %order.id,
			recipient = %recipient,
			amount = %order.amount,
			fulfilled = order.is_fulfilled(),
			"Demand order finalized"
		);
		Ok(FinalizationOutcome::Settled {
			order: order.clone(),
			recipient,
		})
	}

	async fn release_packet(&self, packet_id: &str) -> Result<Option<PendingPacket>, FinalizationError> {
		let Some(packet) = self.transition_packet(packet_id, PacketStatus::Finalized) else {
			return Ok(None);
		};

		if let Err(e) = self
			.ledger
			.bank()
			.send(ESCROW_ACCOUNT, &packet.receiver, &packet.denom, packet.amount)
			.await
		{
			self.transition_packet_back(packet_id);
			return Err(e.into());
		}

		info!(packet_id, receiver = %packet.receiver, amount = %packet.amount, "Released held packet");
		Ok(Some(packet))
	}

	/// Moves a pending packet to `status`, returning it; `None` if it was
	/// not pending. The map entry lock makes this the packet's claim point.
	fn transition_packet(&self, packet_id: &str, status: PacketStatus) -> Option<PendingPacket> {
		let mut entry = self.packets.get_mut(packet_id)?;
		if entry.status != PacketStatus::Pending {
			return None;
		}
		entry.status = status;
		Some(entry.clone())
	}

	fn transition_packet_back(&self, packet_id: &str) {
		if let Some(mut entry) = self.packets.get_mut(packet_id) {
			entry.status = PacketStatus::Pending;
		}
	}

	/// Unsettled order ids and packet ids, grouped by rollapp then height.
	async fn unsettled_heights(
		&self,
	) -> BTreeMap<ChainName, BTreeMap<Height, (Vec<OrderId>, Vec<String>)>> {
		let mut grouped: BTreeMap<ChainName, BTreeMap<Height, (Vec<OrderId>, Vec<String>)>> =
			BTreeMap::new();

		let unsettled = self
			.ledger
			.list(&OrderFilter::default())
			.await
			.into_iter()
			.filter(|o| !o.status.is_terminal());
		for order in unsettled {
			grouped
				.entry(order.rollapp_id)
				.or_default()
				.entry(order.source_height)
				.or_default()
				.0
				.push(order.id);
		}
		for packet in self.pending_packets() {
			grouped
				.entry(packet.rollapp_id)
				.or_default()
				.entry(packet.source_height)
				.or_default()
				.1
				.push(packet.packet_id);
		}
		grouped
	}
}
