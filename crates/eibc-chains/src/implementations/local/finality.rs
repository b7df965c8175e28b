//! Rollapp finality from state updates.

use crate::ChainError;
use async_trait::async_trait;
use dashmap::DashMap;
use eibc_types::{ChainName, FinalityOracle, Height};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A batch of rollapp blocks posted to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
	pub start_height: Height,
	pub end_height: Height,
	/// Hub height the update was posted at.
	pub submitted_at: Height,
	pub finalized: bool,
}

struct RollappState {
	dispute_period_in_blocks: Height,
	updates: Vec<StateUpdate>,
}

impl RollappState {
	fn last_end(&self) -> Height {
		self.updates.last().map_or(0, |u| u.end_height)
	}

	fn finalized_height(&self) -> Height {
		self.updates
			.iter()
			.take_while(|u| u.finalized)
			.last()
			.map_or(0, |u| u.end_height)
	}
}

/// Tracks the state updates of every registered rollapp. An update becomes
/// final once `dispute_period_in_blocks` hub blocks have passed since it was
/// posted; updates finalize in order.
#[derive(Default)]
pub struct RollappFinality {
	rollapps: DashMap<ChainName, RollappState>,
	hub_height: AtomicU64,
}

impl RollappFinality {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, rollapp_id: &str, dispute_period_in_blocks: Height) {
		self.rollapps.insert(
			rollapp_id.to_string(),
			RollappState {
				dispute_period_in_blocks,
				updates: Vec::new(),
			},
		);
	}

	pub fn dispute_period(&self, rollapp_id: &str) -> Option<Height> {
		self.rollapps
			.get(rollapp_id)
			.map(|r| r.dispute_period_in_blocks)
	}

	/// Posts rollapp blocks up to `end_height` at the current hub height.
	pub fn submit_state_update(
		&self,
		rollapp_id: &str,
		end_height: Height,
	) -> Result<StateUpdate, ChainError> {
		let mut rollapp = self
			.rollapps
			.get_mut(rollapp_id)
			.ok_or_else(|| ChainError::UnknownRollapp(rollapp_id.to_string()))?;
		let last = rollapp.last_end();
		if end_height <= last {
			return Err(ChainError::StaleStateUpdate {
				rollapp_id: rollapp_id.to_string(),
				last,
				end_height,
			});
		}

		let update = StateUpdate {
			start_height: last + 1,
			end_height,
			submitted_at: self.hub_height.load(Ordering::SeqCst),
			finalized: false,
		};
		debug!(
			rollapp = %rollapp_id,
			start = update.start_height,
			end = update.end_height,
			"State update submitted"
		);
		rollapp.updates.push(update.clone());
		Ok(update)
	}

	/// Finalizes every update whose dispute period ended by `hub_height`.
	/// Returns the rollapps whose finalized height moved.
	pub fn on_hub_block(&self, hub_height: Height) -> Vec<(ChainName, Height)> {
		self.hub_height.fetch_max(hub_height, Ordering::SeqCst);
		let mut advanced = Vec::new();

		for mut entry in self.rollapps.iter_mut() {
			let period = entry.dispute_period_in_blocks;
			let mut moved = false;
			for update in entry.updates.iter_mut().filter(|u| !u.finalized) {
				if update.submitted_at.saturating_add(period) > hub_height {
					break;
				}
				update.finalized = true;
				moved = true;
			}
			if moved {
				let finalized = entry.finalized_height();
				info!(rollapp = %entry.key(), finalized, "Rollapp height finalized");
				advanced.push((entry.key().clone(), finalized));
			}
		}
		advanced
	}

	/// Highest rollapp height known final, 0 if none.
	pub fn finalized_height(&self, rollapp_id: &str) -> Height {
		self.rollapps
			.get(rollapp_id)
			.map_or(0, |r| r.finalized_height())
	}

	pub fn state_updates(&self, rollapp_id: &str) -> Vec<StateUpdate> {
		self.rollapps
			.get(rollapp_id)
			.map(|r| r.updates.clone())
			.unwrap_or_default()
	}

	/// Drops every non-final update covering `from_height` or above, as
	/// after a successful fraud proof.
	pub fn revert(&self, rollapp_id: &str, from_height: Height) -> Result<(), ChainError> {
		let mut rollapp = self
			.rollapps
			.get_mut(rollapp_id)
			.ok_or_else(|| ChainError::UnknownRollapp(rollapp_id.to_string()))?;
		let before = rollapp.updates.len();
		rollapp
			.updates
			.retain(|u| u.finalized || u.end_height < from_height);
		warn!(
			rollapp = %rollapp_id,
			from_height,
			dropped = before - rollapp.updates.len(),
			"State updates reverted"
		);
		Ok(())
	}
}

#[async_trait]
impl FinalityOracle for RollappFinality {
	async fn is_height_finalized(
		&self,
		rollapp_id: &str,
		height: Height,
	) -> eibc_types::Result<bool> {
		match self.rollapps.get(rollapp_id) {
			Some(rollapp) => Ok(height <= rollapp.finalized_height()),
			None => Err(ChainError::UnknownRollapp(rollapp_id.to_string()).into()),
		}
	}
}
