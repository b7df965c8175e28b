// eibc-core/src/lifecycle.rs

use crate::error::CoreError;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
	Created,
	Running,
	Stopping,
	Stopped,
	Failed,
}

impl std::fmt::Display for LifecycleState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Self::Created => "Created",
			Self::Running => "Running",
			Self::Stopping => "Stopping",
			Self::Stopped => "Stopped",
			Self::Failed => "Failed",
		};
		f.write_str(name)
	}
}

/// Tracks the engine's run state and fans out the shutdown signal to its
/// background tasks (block producer, forward ticker).
#[derive(Clone)]
pub struct LifecycleManager {
	state: Arc<RwLock<LifecycleState>>,
	shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
	pub fn new() -> Self {
		let (shutdown_tx, _) = broadcast::channel(16);
		Self {
			state: Arc::new(RwLock::new(LifecycleState::Created)),
			shutdown_tx,
		}
	}

	pub async fn state(&self) -> LifecycleState {
		*self.state.read().await
	}

	async fn transition(&self, to: LifecycleState) -> Result<(), CoreError> {
		let mut state = self.state.write().await;
		let from = *state;

		let allowed = matches!(
			(from, to),
			(LifecycleState::Created, LifecycleState::Running)
				| (LifecycleState::Running, LifecycleState::Stopping)
				| (LifecycleState::Stopping, LifecycleState::Stopped)
				| (_, LifecycleState::Failed)
		);
		if !allowed {
			return Err(CoreError::Lifecycle(format!(
				"Invalid state transition from {} to {}",
				from, to
			)));
		}

		*state = to;
		info!("Lifecycle state changed: {} -> {}", from, to);
		Ok(())
	}

	pub async fn start(&self) -> Result<(), CoreError> {
		self.transition(LifecycleState::Running).await
	}

	/// Signals every subscriber and moves to `Stopped`.
	pub async fn shutdown(&self) -> Result<(), CoreError> {
		self.transition(LifecycleState::Stopping).await?;
		let _ = self.shutdown_tx.send(());
		self.transition(LifecycleState::Stopped).await
	}

	pub async fn fail(&self) -> Result<(), CoreError> {
		let _ = self.shutdown_tx.send(());
		self.transition(LifecycleState::Failed).await
	}

	pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
		self.shutdown_tx.subscribe()
	}

	pub async fn is_running(&self) -> bool {
		self.state().await == LifecycleState::Running
	}
}

impl Default for LifecycleManager {
	fn default() -> Self {
		Self::new()
	}
}
