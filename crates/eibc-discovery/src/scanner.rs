//! Height-range event scanner.

use crate::{
	events::{EventStream, IndexedEvent},
	ScanError,
};
use backoff::{backoff::Backoff, ExponentialBackoff};
use eibc_types::{ChainAdapter, Height, TxResult};
use futures::StreamExt;
use std::{ops::RangeInclusive, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Retry and pacing settings for a scan.
#[derive(Debug, Clone)]
pub struct ScanConfig {
	/// Retries per height after the first failed read.
	pub max_retries: u32,
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
	/// Wait for the chain to reach each height before reading it.
	pub wait_for_blocks: bool,
}

impl Default for ScanConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_backoff: Duration::from_millis(100),
			max_backoff: Duration::from_secs(2),
			wait_for_blocks: true,
		}
	}
}

impl ScanConfig {
	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoff {
			initial_interval: self.initial_backoff,
			current_interval: self.initial_backoff,
			max_interval: self.max_backoff,
			max_elapsed_time: None,
			..Default::default()
		}
	}
}

/// Scans a chain's indexed transactions over height ranges.
#[derive(Clone)]
pub struct EventScanner {
	adapter: Arc<dyn ChainAdapter>,
	config: ScanConfig,
}

impl EventScanner {
	pub fn new(adapter: Arc<dyn ChainAdapter>, config: ScanConfig) -> Self {
		Self { adapter, config }
	}

	pub fn adapter(&self) -> &Arc<dyn ChainAdapter> {
		&self.adapter
	}

	/// Events of successful transactions in `range`, in height order, then
	/// transaction order, then emission order. `kind` restricts the event
	/// type.
	///
	/// A height that cannot be read after all retries yields one error and
	/// the scan moves on to the next height. The stream is not restartable;
	/// scanning an overlapping range again is safe.
	pub fn scan(&self, range: RangeInclusive<Height>, kind: Option<&str>) -> EventStream {
		let adapter = self.adapter.clone();
		let config = self.config.clone();
		let kind = kind.map(str::to_string);

		let stream = async_stream::stream! {
			for height in range {
				if config.wait_for_blocks {
					if let Err(e) = adapter.wait_for_height(height).await {
						yield Err(ScanError::Chain { height, reason: e.to_string() });
						continue;
					}
				}

				match fetch_with_retry(adapter.as_ref(), height, &config).await {
					Ok(txs) => {
						debug!(height, txs = txs.len(), "Scanned height");
						for tx in txs.into_iter().filter(TxResult::is_success) {
							for (index, event) in tx.events.into_iter().enumerate() {
								if kind.as_deref().map_or(true, |k| k == event.kind) {
									yield Ok(IndexedEvent {
										height,
										tx_hash: tx.hash.clone(),
										index,
										event,
									});
								}
							}
						}
					}
					Err(e) => {
						error!(height, error = %e, "Giving up on height");
						yield Err(e);
					}
				}
			}
		};

		Box::pin(stream)
	}

	/// First matching event in `range`; stops reading as soon as it is found.
	/// Unreadable heights are skipped.
	pub async fn first_of(
		&self,
		range: RangeInclusive<Height>,
		kind: Option<&str>,
	) -> Option<IndexedEvent> {
		let mut stream = self.scan(range, kind);
		while let Some(item) = stream.next().await {
			match item {
				Ok(event) => return Some(event),
				Err(e) => warn!(error = %e, "Skipping unreadable height"),
			}
		}
		None
	}

	/// Every matching event in `range`, plus the heights that could not be
	/// read.
	pub async fn collect(
		&self,
		range: RangeInclusive<Height>,
		kind: Option<&str>,
	) -> (Vec<IndexedEvent>, Vec<ScanError>) {
		let mut events = Vec::new();
		let mut errors = Vec::new();
		let mut stream = self.scan(range, kind);
		while let Some(item) = stream.next().await {
			match item {
				Ok(event) => events.push(event),
				Err(e) => errors.push(e),
			}
		}
		(events, errors)
	}
}

async fn fetch_with_retry(
	adapter: &dyn ChainAdapter,
	height: Height,
	config: &ScanConfig,
) -> Result<Vec<TxResult>, ScanError> {
	let mut backoff = config.backoff();
	let mut attempts = 0;

	loop {
		match adapter.txs_at(height).await {
			Ok(txs) => return Ok(txs),
			Err(e) if !e.is_transient() => {
				return Err(ScanError::Chain {
					height,
					reason: e.to_string(),
				})
			}
			Err(e) => {
				attempts += 1;

				if attempts > config.max_retries {
					return Err(ScanError::HeightUnavailable {
						height,
						attempts,
						reason: e.to_string(),
					});
				}

				match backoff.next_backoff() {
					Some(delay) => {
						warn!(
							"Read of height {} failed, attempt {}/{}, retrying in {:?}: {}",
							height, attempts, config.max_retries, delay, e
						);
						tokio::time::sleep(delay).await;
					}
					None => {
						return Err(ScanError::HeightUnavailable {
							height,
							attempts,
							reason: e.to_string(),
						})
					}
				}
			}
		}
	}
}
