//! Watches a chain for `eibc` events.

use crate::{events::IndexedEvent, scanner::EventScanner, ScanError};
use dashmap::DashSet;
use eibc_types::{EibcEvent, Height, TxHash, EIBC_EVENT_TYPE};
use futures::StreamExt;
use std::{
	ops::RangeInclusive,
	sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, warn};

/// Decoded `eibc` event with its position on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEibcEvent {
	pub height: Height,
	pub tx_hash: TxHash,
	pub event: EibcEvent,
}

/// Reports each `eibc` event once, however often its height is scanned.
pub struct EibcEventWatcher {
	scanner: EventScanner,
	seen: DashSet<(Height, TxHash, usize)>,
	/// Heights below this were fully reported and are skipped.
	floor: AtomicU64,
}

impl EibcEventWatcher {
	pub fn new(scanner: EventScanner) -> Self {
		Self {
			scanner,
			seen: DashSet::new(),
			floor: AtomicU64::new(0),
		}
	}

	/// New `eibc` events in `range`, plus heights that could not be read.
	/// Events that fail to decode are logged and skipped.
	pub async fn poll(
		&self,
		range: RangeInclusive<Height>,
	) -> (Vec<ObservedEibcEvent>, Vec<ScanError>) {
		let mut fresh = Vec::new();
		let mut errors = Vec::new();

		let mut stream = self.scanner.scan(range, Some(EIBC_EVENT_TYPE));
		while let Some(item) = stream.next().await {
			match item {
				Ok(indexed) => {
					if let Some(observed) = self.observe(indexed) {
						fresh.push(observed);
					}
				}
				Err(e) => errors.push(e),
			}
		}

		debug!(new = fresh.len(), failed_heights = errors.len(), "Polled eibc events");
		(fresh, errors)
	}

	/// Latest `eibc` event for `order_id` in `range`, whether or not it was
	/// reported before.
	pub async fn latest_for_order(
		&self,
		range: RangeInclusive<Height>,
		order_id: &str,
	) -> Option<ObservedEibcEvent> {
		let (events, _) = self
			.scanner
			.collect(range, Some(EIBC_EVENT_TYPE))
			.await;
		events
			.into_iter()
			.rev()
			.filter_map(|indexed| decode(&indexed))
			.find(|observed| observed.event.id == order_id)
	}

	pub fn seen(&self) -> usize {
		self.seen.len()
	}

	/// Forgets the events below `height`. The caller guarantees every height
	/// below it was scanned completely; later polls skip those heights.
	pub fn prune_below(&self, height: Height) {
		let floor = self.floor.fetch_max(height, Ordering::SeqCst).max(height);
		self.seen.retain(|(h, _, _)| *h >= floor);
	}

	fn observe(&self, indexed: IndexedEvent) -> Option<ObservedEibcEvent> {
		if indexed.height < self.floor.load(Ordering::SeqCst) {
			return None;
		}
		if !self.seen.insert(indexed.key()) {
			return None;
		}
		decode(&indexed)
	}
}

fn decode(indexed: &IndexedEvent) -> Option<ObservedEibcEvent> {
	match EibcEvent::try_from(&indexed.event) {
		Ok(event) => Some(ObservedEibcEvent {
			height: indexed.height,
			tx_hash: indexed.tx_hash.clone(),
			event,
		}),
		Err(e) => {
			warn!(height = indexed.height, tx = %indexed.tx_hash, error = %e, "Undecodable eibc event");
			None
		}
	}
}
