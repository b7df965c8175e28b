//! Demand order ledger.
//!
//! The ledger exclusively owns every demand order. Each order sits behind
//! its own async mutex; fulfillment, finalization and revert all go through
//! [`DemandOrderLedger::lock`], so operations on one order are serialized
//! while different orders proceed in parallel.

use crate::types::LedgerError;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use eibc_types::{
	Amount, BankKeeper, DemandOrder, DenomTrace, InboundTransfer, LedgerStats, OrderFilter,
	OrderId, OrderStatus, PacketStatus, ESCROW_ACCOUNT,
};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Exclusive access to one order. Changes made through the guard are the
/// ledger's state once it is dropped.
pub type OrderGuard = OwnedMutexGuard<DemandOrder>;

pub struct DemandOrderLedger {
	orders: DashMap<OrderId, Arc<Mutex<DemandOrder>>>,
	bank: Arc<dyn BankKeeper>,
}

impl DemandOrderLedger {
	pub fn new(bank: Arc<dyn BankKeeper>) -> Self {
		Self {
			orders: DashMap::new(),
			bank,
		}
	}

	pub fn bank(&self) -> &Arc<dyn BankKeeper> {
		&self.bank
	}

	/// Opens a demand order for an inbound rollapp transfer and escrows its
	/// full amount in `denom_trace.ibc_denom()`.
	///
	/// Rejected with [`LedgerError::FeeExceedsAmount`] when `fee >= amount`;
	/// nothing is created or minted in that case.
	pub async fn create_order(
		&self,
		transfer: &InboundTransfer,
		denom_trace: DenomTrace,
		fee: Amount,
	) -> Result<DemandOrder, LedgerError> {
		if fee >= transfer.amount {
			return Err(LedgerError::FeeExceedsAmount {
				fee,
				amount: transfer.amount,
			});
		}

		let now = Utc::now();
		let order = DemandOrder {
			id: transfer.packet_id(),
			rollapp_id: transfer.source_chain.clone(),
			source_height: transfer.source_height,
			original_receiver: transfer.receiver.clone(),
			denom: denom_trace.ibc_denom(),
			denom_trace,
			amount: transfer.amount,
			price: transfer.amount - fee,
			fee,
			status: OrderStatus::Pending,
			packet_status: PacketStatus::Pending,
			fulfiller: None,
			created_at: now,
			updated_at: now,
			fulfilled_at: None,
		};

		// Reserve the id before escrowing; the map shard lock must not be
		// held across the mint.
		let slot = Arc::new(Mutex::new(order.clone()));
		let reserved = slot.clone().lock_owned().await;
		match self.orders.entry(order.id.clone()) {
			Entry::Occupied(_) => return Err(LedgerError::DuplicateOrder(order.id)),
			Entry::Vacant(vacant) => {
				vacant.insert(slot);
			}
		}

		if let Err(e) = self
			.bank
			.mint(ESCROW_ACCOUNT, &order.denom, order.amount)
			.await
		{
			self.orders.remove(&order.id);
			return Err(e.into());
		}
		drop(reserved);

		info!(
			order_id = %order.id,
			rollapp = %order.rollapp_id,
			amount = %order.amount,
			fee = %order.fee,
			"Created demand order"
		);
		Ok(order)
	}

	/// Snapshot of one order.
	pub async fn lookup(&self, id: &str) -> Result<DemandOrder, LedgerError> {
		let slot = self.slot(id)?;
		let order = slot.lock().await;
		Ok(order.clone())
	}

	/// Waits for exclusive access to one order.
	pub async fn lock(&self, id: &str) -> Result<OrderGuard, LedgerError> {
		let slot = self.slot(id)?;
		debug!(order_id = %id, "Locking demand order");
		Ok(slot.lock_owned().await)
	}

	pub fn contains(&self, id: &str) -> bool {
		self.orders.contains_key(id)
	}

	/// Orders matching `filter`, oldest first.
	pub async fn list(&self, filter: &OrderFilter) -> Vec<DemandOrder> {
		let mut orders = Vec::new();
		for slot in self.slots() {
			let order = slot.lock().await;
			if filter.matches(&order) {
				orders.push(order.clone());
			}
		}
		orders.sort_by(|a, b| {
			a.created_at
				.cmp(&b.created_at)
				.then_with(|| a.id.cmp(&b.id))
		});
		orders
	}

	/// Unsettled orders of `rollapp_id` (pending or fulfilled), by height.
	pub async fn pending_for(&self, rollapp_id: &str) -> Vec<DemandOrder> {
		let mut orders: Vec<_> = self
			.list(&OrderFilter {
				rollapp_id: Some(rollapp_id.to_string()),
				..Default::default()
			})
			.await
			.into_iter()
			.filter(|o| !o.status.is_terminal())
			.collect();
		orders.sort_by_key(|o| o.source_height);
		orders
	}

	pub async fn stats(&self) -> LedgerStats {
		let mut stats = LedgerStats::default();
		for slot in self.slots() {
			let order = slot.lock().await;
			stats.total += 1;
			match order.status {
				OrderStatus::Pending => stats.pending += 1,
				OrderStatus::Fulfilled => stats.fulfilled += 1,
				OrderStatus::Finalized => stats.finalized += 1,
				OrderStatus::Reverted => stats.reverted += 1,
			}
		}
		stats
	}

	fn slot(&self, id: &str) -> Result<Arc<Mutex<DemandOrder>>, LedgerError> {
		self.orders
			.get(id)
			.map(|entry| entry.value().clone())
			.ok_or_else(|| LedgerError::NotFound(id.to_string()))
	}

	// Clone the handles out so no shard lock is held while awaiting.
	fn slots(&self) -> Vec<Arc<Mutex<DemandOrder>>> {
		self.orders.iter().map(|e| e.value().clone()).collect()
	}
}
