//! Settlement of demand orders: fulfillment by market makers and payout
//! once the originating rollapp height is final.

use eibc_state::LedgerError;
use eibc_types::{BankError, ChainName, EibcError, Height, OrderId, OrderStatus};
use thiserror::Error;

pub mod finalization;
pub mod fulfillment;

pub use finalization::{
	FinalizationMonitor, FinalizationOutcome, FinalizationReport, PendingPacket, RevertReport,
};
pub use fulfillment::{FulfillmentEngine, FulfillmentReceipt};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FulfillmentError {
	#[error("demand order {0} not found")]
	OrderNotFound(OrderId),

	#[error("{0} is a module account and cannot fulfill orders")]
	ModuleAccount(String),

	#[error("demand order {0} is already fulfilled")]
	AlreadyFulfilled(OrderId),

	#[error("demand order {id} can no longer be fulfilled: status {status}")]
	Closed { id: OrderId, status: OrderStatus },

	#[error("{0}")]
	InsufficientFunds(BankError),

	#[error("bank error: {0}")]
	Bank(BankError),

	#[error("ledger error: {0}")]
	Ledger(String),
}

impl From<LedgerError> for FulfillmentError {
	fn from(err: LedgerError) -> Self {
		match err {
			LedgerError::NotFound(id) => Self::OrderNotFound(id),
			LedgerError::Bank(e) => Self::Bank(e),
			other => Self::Ledger(other.to_string()),
		}
	}
}

impl From<FulfillmentError> for EibcError {
	fn from(err: FulfillmentError) -> Self {
		match err {
			FulfillmentError::OrderNotFound(id) => EibcError::NotFound(format!("demand order {}", id)),
			other => EibcError::Settlement(other.to_string()),
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FinalizationError {
	#[error("demand order {0} not found")]
	OrderNotFound(OrderId),

	#[error("height {height} of {rollapp_id} is not finalized yet")]
	FinalityNotProven { rollapp_id: ChainName, height: Height },

	#[error("demand order {0} was reverted")]
	Reverted(OrderId),

	#[error("packet {0} is already tracked")]
	DuplicatePacket(String),

	#[error("finality oracle error: {0}")]
	Oracle(String),

	#[error("height {height} of {rollapp_id} not finalized within {blocks} blocks")]
	Timeout {
		rollapp_id: ChainName,
		height: Height,
		blocks: Height,
	},

	#[error(transparent)]
	Bank(#[from] BankError),

	#[error("ledger error: {0}")]
	Ledger(String),
}

impl From<LedgerError> for FinalizationError {
	fn from(err: LedgerError) -> Self {
		match err {
			LedgerError::NotFound(id) => Self::OrderNotFound(id),
			LedgerError::Bank(e) => Self::Bank(e),
			other => Self::Ledger(other.to_string()),
		}
	}
}

impl From<FinalizationError> for EibcError {
	fn from(err: FinalizationError) -> Self {
		match err {
			FinalizationError::OrderNotFound(id) => {
				EibcError::NotFound(format!("demand order {}", id))
			}
			FinalizationError::Timeout { .. } => EibcError::Timeout(err.to_string()),
			other => EibcError::Settlement(other.to_string()),
		}
	}
}

#[cfg(test)]
pub(crate) mod testing {
	use async_trait::async_trait;
	use eibc_state::{DemandOrderLedger, MemoryBank};
	use eibc_types::{DemandOrder, FinalityOracle, Height, InboundTransfer, TRANSFER_PORT};
	use std::{collections::HashMap, sync::Arc};
	use tokio::sync::RwLock;

	pub const ROLLAPP: &str = "rollappevm_1234-1";
	pub const RECEIVER: &str = "dym1receiver";
	pub const MARKET_MAKER: &str = "dym1marketmaker";

	/// Oracle whose finalized height per rollapp is set by the test.
	#[derive(Default)]
	pub struct ManualOracle {
		finalized: RwLock<HashMap<String, Height>>,
	}

	impl ManualOracle {
		pub async fn finalize_up_to(&self, rollapp_id: &str, height: Height) {
			self.finalized
				.write()
				.await
				.insert(rollapp_id.to_string(), height);
		}
	}

	#[async_trait]
	impl FinalityOracle for ManualOracle {
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

	pub fn transfer(sequence: u64, source_height: Height, amount: u128) -> InboundTransfer {
		InboundTransfer {
			sequence,
			source_port: TRANSFER_PORT.to_string(),
			source_channel: "channel-0".to_string(),
			dest_port: TRANSFER_PORT.to_string(),
			dest_channel: "channel-0".to_string(),
			source_chain: ROLLAPP.to_string(),
			source_height,
			denom: "urax".to_string(),
			amount,
			sender: "ethm1sender".to_string(),
			receiver: RECEIVER.to_string(),
			memo: String::new(),
		}
	}

	pub fn setup() -> (Arc<MemoryBank>, Arc<DemandOrderLedger>) {
		let bank = Arc::new(MemoryBank::new());
		let ledger = Arc::new(DemandOrderLedger::new(bank.clone()));
		(bank, ledger)
	}

	pub async fn open_order(
		ledger: &DemandOrderLedger,
		sequence: u64,
		source_height: Height,
		amount: u128,
		fee: u128,
	) -> DemandOrder {
		let packet = transfer(sequence, source_height, amount);
		ledger
			.create_order(&packet, packet.hub_denom_trace(), fee)
			.await
			.unwrap()
	}
}
