//! Indexed events as produced by a scan.

use crate::ScanError;
use eibc_types::{ChainEvent, Height, TxHash};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// An event together with where it was indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
	pub height: Height,
	pub tx_hash: TxHash,
	/// Position of the event within its transaction.
	pub index: usize,
	pub event: ChainEvent,
}

impl IndexedEvent {
	/// Uniquely identifies this event on its chain.
	pub fn key(&self) -> (Height, TxHash, usize) {
		(self.height, self.tx_hash.clone(), self.index)
	}
}

/// Lazy, finite stream of scan results. Dropping it cancels the scan.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<IndexedEvent, ScanError>> + Send>>;
