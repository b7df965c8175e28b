//! Fulfillment of pending demand orders by market makers.

use crate::FulfillmentError;
use chrono::Utc;
use eibc_state::DemandOrderLedger;
use eibc_types::{is_module_account, BankError, DemandOrder, EibcEvent, OrderStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What a successful fulfillment changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentReceipt {
	pub order: DemandOrder,
	pub event: EibcEvent,
}

pub struct FulfillmentEngine {
	ledger: Arc<DemandOrderLedger>,
}

impl FulfillmentEngine {
	pub fn new(ledger: Arc<DemandOrderLedger>) -> Self {
		Self { ledger }
	}

	/// Pays `price` from `fulfiller` to the order's original receiver and
	/// makes `fulfiller` the beneficiary of the escrow.
	///
	/// At most one call per order succeeds. On any error the order and all
	/// balances are left exactly as they were. Cross-chain finality is not
	/// awaited.
	#[instrument(skip(self))]
	pub async fn fulfill(
		&self,
		order_id: &str,
		fulfiller: &str,
	) -> Result<FulfillmentReceipt, FulfillmentError> {
		if is_module_account(fulfiller) {
			warn!(order_id, fulfiller, "Rejected fulfillment from a module account");
			return Err(FulfillmentError::ModuleAccount(fulfiller.to_string()));
		}
		let mut order = self.ledger.lock(order_id).await?;

		match order.status {
			OrderStatus::Pending => {}
			OrderStatus::Fulfilled => {
				warn!(order_id, "Rejected fulfillment of an already fulfilled order");
				return Err(FulfillmentError::AlreadyFulfilled(order.id.clone()));
			}
			status => {
				warn!(order_id, %status, "Rejected fulfillment of a closed order");
				return Err(FulfillmentError::Closed {
					id: order.id.clone(),
					status,
				});
			}
		}

		// In-memory transfer; no I/O under the order lock.
		self.ledger
			.bank()
			.send(fulfiller, &order.original_receiver, &order.denom, order.price)
			.await
			.map_err(|e| match e {
				BankError::InsufficientFunds { .. } => {
					warn!(order_id, fulfiller, error = %e, "Fulfiller cannot cover the order");
					FulfillmentError::InsufficientFunds(e)
				}
				other => FulfillmentError::Bank(other),
			})?;

		let now = Utc::now();
		order.fulfiller = Some(fulfiller.to_string());
		order.status = OrderStatus::Fulfilled;
		order.fulfilled_at = Some(now);
		order.updated_at = now;

		let snapshot = order.clone();
		drop(order);

		info!(
			order_id,
			fulfiller,
			price = %snapshot.price,
			fee = %snapshot.fee,
			"Demand order fulfilled"
		);

		Ok(FulfillmentReceipt {
			event: EibcEvent::from_order(&snapshot),
			order: snapshot,
		})
	}
}
