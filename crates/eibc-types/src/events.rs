use serde::{Deserialize, Serialize};

use crate::{
	common::{Address, Amount, ChainName, Height, OrderId},
	errors::EibcError,
	forward::{ForwardInstruction, InstructionId},
	order::{DemandOrder, OrderStatus, PacketStatus},
	transfer::PacketHandle,
};

/// Type of the event emitted whenever a demand order is created or changes.
pub const EIBC_EVENT_TYPE: &str = "eibc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
	pub key: String,
	pub value: String,
}

/// A typed key/value event as indexed by the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
	#[serde(rename = "type")]
	pub kind: String,
	pub attributes: Vec<EventAttribute>,
}

impl ChainEvent {
	pub fn new(kind: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			attributes: Vec::new(),
		}
	}

	pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
		self.attributes.push(EventAttribute {
			key: key.into(),
			value: value.to_string(),
		});
		self
	}

	/// First value recorded under `key`.
	pub fn attribute(&self, key: &str) -> Option<&str> {
		self.attributes
			.iter()
			.find(|a| a.key == key)
			.map(|a| a.value.as_str())
	}
}

/// Decoded form of an `eibc` chain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EibcEvent {
	pub id: OrderId,
	#[serde(with = "crate::serde_helpers::amount")]
	pub price: Amount,
	#[serde(with = "crate::serde_helpers::amount")]
	pub fee: Amount,
	pub is_fulfilled: bool,
	pub packet_status: PacketStatus,
}

impl EibcEvent {
	pub fn from_order(order: &DemandOrder) -> Self {
		Self {
			id: order.id.clone(),
			price: order.price,
			fee: order.fee,
			is_fulfilled: order.is_fulfilled(),
			packet_status: order.packet_status,
		}
	}

	pub fn to_chain_event(&self) -> ChainEvent {
		ChainEvent::new(EIBC_EVENT_TYPE)
			.with_attribute("id", &self.id)
			.with_attribute("price", self.price)
			.with_attribute("fee", self.fee)
			.with_attribute("is_fulfilled", self.is_fulfilled)
			.with_attribute("packet_status", self.packet_status)
	}
}

impl TryFrom<&ChainEvent> for EibcEvent {
	type Error = EibcError;

	fn try_from(event: &ChainEvent) -> Result<Self, Self::Error> {
		if event.kind != EIBC_EVENT_TYPE {
			return Err(EibcError::InvalidEvent(format!(
				"expected {} event, got {}",
				EIBC_EVENT_TYPE, event.kind
			)));
		}

		let field = |key: &str| {
			event
				.attribute(key)
				.ok_or_else(|| EibcError::InvalidEvent(format!("missing attribute {}", key)))
		};
		let amount = |key: &str| -> Result<Amount, EibcError> {
			field(key)?
				.parse()
				.map_err(|_| EibcError::InvalidEvent(format!("invalid {} attribute", key)))
		};

		Ok(Self {
			id: field("id")?.to_string(),
			price: amount("price")?,
			fee: amount("fee")?,
			is_fulfilled: field("is_fulfilled")?
				.parse()
				.map_err(|_| EibcError::InvalidEvent("invalid is_fulfilled attribute".into()))?,
			packet_status: field("packet_status")?
				.parse()
				.map_err(EibcError::InvalidEvent)?,
		})
	}
}

/// Events published on the engine's in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
	Packet(PacketEvent),
	Order(OrderEvent),
	Forward(ForwardEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PacketEvent {
	/// Credited at once; the sender is not a registered rollapp.
	Credited {
		packet_id: String,
		receiver: Address,
		#[serde(with = "crate::serde_helpers::amount")]
		amount: Amount,
	},
	/// Escrowed until the rollapp height is final.
	Held {
		packet_id: String,
		rollapp_id: ChainName,
		source_height: Height,
		reason: String,
	},
	Released {
		packet_id: String,
		receiver: Address,
	},
	Reverted {
		packet_id: String,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
	Created { order: DemandOrder },
	Fulfilled { order: DemandOrder },
	FulfillmentRejected { order_id: OrderId, reason: String },
	Finalized { order: DemandOrder },
	Reverted { order_id: OrderId, previous: OrderStatus },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForwardEvent {
	Scheduled { instruction: ForwardInstruction },
	Sent { id: InstructionId, packet: PacketHandle },
	AttemptFailed { id: InstructionId, error: String },
	Cancelled { id: InstructionId },
	Failed { id: InstructionId, error: String },
	/// Burned with the reverted rollapp state it came from.
	Reverted { id: InstructionId },
}
