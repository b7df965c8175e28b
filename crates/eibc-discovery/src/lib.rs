//! # eIBC Discovery
//!
//! Height-range scanning of indexed chain events.
//!
//! - [`EventScanner`] turns a height range into a lazy stream of events,
//!   retrying each height on transient read failures.
//! - [`EibcEventWatcher`] decodes `eibc` events and remembers what it has
//!   already reported, so overlapping scans are safe.

use eibc_types::{EibcError, Height};
use thiserror::Error;

pub mod events;
pub mod scanner;
pub mod watcher;

pub use events::{EventStream, IndexedEvent};
pub use scanner::{EventScanner, ScanConfig};
pub use watcher::{EibcEventWatcher, ObservedEibcEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
	#[error("height {height} unavailable after {attempts} attempts: {reason}")]
	HeightUnavailable {
		height: Height,
		attempts: u32,
		reason: String,
	},

	#[error("chain error at height {height}: {reason}")]
	Chain { height: Height, reason: String },
}

impl ScanError {
	pub fn height(&self) -> Height {
		match self {
			Self::HeightUnavailable { height, .. } | Self::Chain { height, .. } => *height,
		}
	}
}

impl From<ScanError> for EibcError {
	fn from(err: ScanError) -> Self {
		match err {
			ScanError::HeightUnavailable { height, reason, .. } => {
				EibcError::TransientRead { height, reason }
			}
			ScanError::Chain { reason, .. } => EibcError::Chain(reason),
		}
	}
}
