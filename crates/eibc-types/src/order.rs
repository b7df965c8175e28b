//! Demand order types.

use crate::{
	common::{Address, Amount, ChainName, Denom, Height, OrderId},
	transfer::DenomTrace,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a demand order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
	Pending,
	Fulfilled,
	Finalized,
	Reverted,
}

impl OrderStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Finalized | Self::Reverted)
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pending => write!(f, "Pending"),
			Self::Fulfilled => write!(f, "Fulfilled"),
			Self::Finalized => write!(f, "Finalized"),
			Self::Reverted => write!(f, "Reverted"),
		}
	}
}

/// Status of the packet behind an order, as reported in `eibc` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketStatus {
	Pending,
	Finalized,
	Reverted,
}

impl PacketStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Pending => "PENDING",
			Self::Finalized => "FINALIZED",
			Self::Reverted => "REVERTED",
		}
	}
}

impl fmt::Display for PacketStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for PacketStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PENDING" => Ok(Self::Pending),
			"FINALIZED" => Ok(Self::Finalized),
			"REVERTED" => Ok(Self::Reverted),
			other => Err(format!("unknown packet status: {}", other)),
		}
	}
}

/// A claim on an in-flight rollapp transfer that anyone may fulfill for a fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandOrder {
	pub id: OrderId,
	pub rollapp_id: ChainName,
	/// Rollapp height that produced the packet; finality is checked against it.
	pub source_height: Height,
	pub original_receiver: Address,
	/// Hub bank denom of the escrowed voucher.
	pub denom: Denom,
	pub denom_trace: DenomTrace,
	#[serde(with = "crate::serde_helpers::amount")]
	pub amount: Amount,
	/// `amount - fee`; what the fulfiller pays up front.
	#[serde(with = "crate::serde_helpers::amount")]
	pub price: Amount,
	#[serde(with = "crate::serde_helpers::amount")]
	pub fee: Amount,
	pub status: OrderStatus,
	pub packet_status: PacketStatus,
	pub fulfiller: Option<Address>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub fulfilled_at: Option<DateTime<Utc>>,
}

impl DemandOrder {
	pub fn is_fulfilled(&self) -> bool {
		self.fulfiller.is_some()
	}

	/// Account that receives the escrowed amount once the packet is final.
	pub fn finalization_recipient(&self) -> &str {
		self.fulfiller.as_deref().unwrap_or(&self.original_receiver)
	}
}

/// Filter for listing orders. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFilter {
	pub status: Option<OrderStatus>,
	pub rollapp_id: Option<ChainName>,
	pub receiver: Option<Address>,
	pub fulfiller: Option<Address>,
}

impl OrderFilter {
	pub fn matches(&self, order: &DemandOrder) -> bool {
		self.status.map_or(true, |s| s == order.status)
			&& self
				.rollapp_id
				.as_ref()
				.map_or(true, |r| *r == order.rollapp_id)
			&& self
				.receiver
				.as_ref()
				.map_or(true, |r| *r == order.original_receiver)
			&& self
				.fulfiller
				.as_ref()
				.map_or(true, |f| order.fulfiller.as_ref() == Some(f))
	}
}

/// Aggregate counts over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
	pub total: usize,
	pub pending: usize,
	pub fulfilled: usize,
	pub finalized: usize,
	pub reverted: usize,
}
