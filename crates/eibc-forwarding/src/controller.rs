//! Grace-period controller for held forwards.

use crate::ForwardError;
use dashmap::DashMap;
use eibc_types::{
	BankKeeper, ForwardHandle, ForwardInstruction, ForwardRequest, ForwardState, ForwardTransport,
	Height, InstructionId, PacketHandle, ESCROW_ACCOUNT,
};
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use std::{
	cmp::Reverse,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Outcome of one [`ForwardGraceController::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
	pub height: Height,
	pub sent: Vec<(InstructionId, PacketHandle)>,
	/// Attempts that failed and will be retried, including exhausted ones
	/// whose escrow could not be released yet.
	pub retrying: Vec<(InstructionId, String)>,
	/// Instructions that used up their retries; funds went to the
	/// intermediate receiver.
	pub failed: Vec<(InstructionId, String)>,
}

impl TickReport {
	pub fn is_empty(&self) -> bool {
		self.sent.is_empty() && self.retrying.is_empty() && self.failed.is_empty()
	}
}

pub struct ForwardGraceController {
	instructions: DashMap<InstructionId, ForwardInstruction>,
	/// Held instructions keyed by the next height they may be attempted at.
	/// Ticks and cancels serialize on this lock, so a cancel can never
	/// interleave with an in-flight send of the same instruction.
	queue: Mutex<PriorityQueue<InstructionId, Reverse<Height>>>,
	transport: Arc<dyn ForwardTransport>,
	bank: Arc<dyn BankKeeper>,
	retry_interval_blocks: Height,
	last_height: AtomicU64,
}

impl ForwardGraceController {
	pub fn new(
		transport: Arc<dyn ForwardTransport>,
		bank: Arc<dyn BankKeeper>,
		retry_interval_blocks: Height,
	) -> Self {
		Self {
			instructions: DashMap::new(),
			queue: Mutex::new(PriorityQueue::new()),
			transport,
			bank,
			retry_interval_blocks: retry_interval_blocks.max(1),
			last_height: AtomicU64::new(0),
		}
	}

	/// Escrows the asset on the hub and holds it until
	/// `received_at + grace_period_blocks`. Scheduling an id that is already
	/// known returns the existing handle and escrows nothing.
	pub async fn schedule(
		&self,
		request: ForwardRequest,
		received_at: Height,
		grace_period_blocks: Height,
	) -> Result<ForwardHandle, ForwardError> {
		let mut queue = self.queue.lock().await;

		if let Some(existing) = self.instructions.get(&request.id) {
			debug!(id = %request.id, "Forward already scheduled");
			return Ok(ForwardHandle {
				id: existing.request.id.clone(),
				hold_until: existing.hold_until,
			});
		}

		self.bank
			.mint(
				ESCROW_ACCOUNT,
				&request.denom_trace.ibc_denom(),
				request.amount,
			)
			.await
			.map_err(|e| ForwardError::Escrow(e.to_string()))?;

		let instruction = ForwardInstruction::new(request, received_at, grace_period_blocks);
		let handle = ForwardHandle {
			id: instruction.id().to_string(),
			hold_until: instruction.hold_until,
		};
		queue.push(handle.id.clone(), Reverse(instruction.next_attempt_at));

		info!(
			id = %handle.id,
			receiver = %instruction.request.receiver,
			channel = %instruction.request.next_channel,
			hold_until = handle.hold_until,
			"Forward held for grace period"
		);
		self.instructions.insert(handle.id.clone(), instruction);
		Ok(handle)
	}

	/// Attempts every held instruction that is due at hub height `now`,
	/// once each.
	pub async fn tick(&self, now: Height) -> TickReport {
		let mut queue = self.queue.lock().await;
		self.last_height.fetch_max(now, Ordering::SeqCst);
		let mut report = TickReport {
			height: now,
			..Default::default()
		};

		let mut due = Vec::new();
		while let Some((_, Reverse(at))) = queue.peek() {
			if *at > now {
				break;
			}
			if let Some((id, _)) = queue.pop() {
				due.push(id);
			}
		}

		for id in due {
			let Some(snapshot) = self.instructions.get(&id).map(|i| i.clone()) else {
				continue;
			};
			if !snapshot.is_due(now) {
				if snapshot.is_held() {
					queue.push(id, Reverse(snapshot.next_attempt_at.max(snapshot.hold_until)));
				}
				continue;
			}

			let result = self.transport.send(&snapshot).await;

			let exhausted = {
				let Some(mut instruction) = self.instructions.get_mut(&id) else {
					continue;
				};
				instruction.attempts += 1;
				match result {
					Ok(packet) => {
						info!(id = %id, packet = %packet, attempts = instruction.attempts, "Forward sent");
						instruction.state = ForwardState::Forwarded {
							packet: packet.clone(),
							at: now,
						};
						instruction.last_error = None;
						report.sent.push((id, packet));
						continue;
					}
					Err(e) => {
						instruction.last_error = Some(e.to_string());
						if instruction.attempts_exhausted() {
							Some((instruction.clone(), e.to_string()))
						} else {
							instruction.next_attempt_at = now + self.retry_interval_blocks;
							warn!(
								id = %id,
								attempts = instruction.attempts,
								next_attempt_at = instruction.next_attempt_at,
								error = %e,
								"Forward attempt failed"
							);
							queue.push(id.clone(), Reverse(instruction.next_attempt_at));
							report.retrying.push((id.clone(), e.to_string()));
							None
						}
					}
				}
			};

			let Some((instruction, send_error)) = exhausted else {
				continue;
			};
			// Only a released escrow ends the instruction. Otherwise it stays
			// held and is attempted again later.
			match self.refund(&instruction).await {
				Ok(()) => {
					error!(id = %id, attempts = instruction.attempts, error = %send_error, "Forward failed permanently");
					if let Some(mut failed) = self.instructions.get_mut(&id) {
						failed.state = ForwardState::Failed { at: now };
					}
					report.failed.push((id, send_error));
				}
				Err(e) => {
					let next_attempt_at = now + self.retry_interval_blocks;
					if let Some(mut held) = self.instructions.get_mut(&id) {
						held.last_error = Some(e.to_string());
						held.next_attempt_at = next_attempt_at;
					}
					queue.push(id.clone(), Reverse(next_attempt_at));
					report.retrying.push((id, e.to_string()));
				}
			}
		}

		report
	}

	/// Cancels a held forward. The escrowed asset goes to the intermediate
	/// receiver on the hub and the forward never fires. If the escrow cannot
	/// be released the instruction stays held.
	pub async fn cancel(&self, handle: &ForwardHandle) -> Result<ForwardInstruction, ForwardError> {
		let mut queue = self.queue.lock().await;

		let held = self
			.instructions
			.get(&handle.id)
			.map(|i| i.clone())
			.ok_or_else(|| ForwardError::NotFound(handle.id.clone()))?;
		if !held.is_held() {
			return Err(ForwardError::NotHeld {
				id: handle.id.clone(),
				state: held.state,
			});
		}

		self.refund(&held).await?;

		let cancelled = {
			let mut instruction = self
				.instructions
				.get_mut(&handle.id)
				.ok_or_else(|| ForwardError::NotFound(handle.id.clone()))?;
			instruction.state = ForwardState::Cancelled {
				at: self.last_height.load(Ordering::SeqCst),
			};
			instruction.clone()
		};
		queue.remove(&handle.id);

		info!(id = %handle.id, "Forward cancelled");
		Ok(cancelled)
	}

	/// Drops every held forward whose inbound packet left `source` at or
	/// above `from_height` and burns its escrow. Returns the reverted ids.
	pub async fn revert(
		&self,
		source: &str,
		from_height: Height,
	) -> Result<Vec<InstructionId>, ForwardError> {
		let mut queue = self.queue.lock().await;
		let at = self.last_height.load(Ordering::SeqCst);

		let mut affected: Vec<ForwardInstruction> = self
			.instructions
			.iter()
			.filter(|i| {
				i.is_held() && i.request.source == source && i.request.source_height >= from_height
			})
			.map(|i| i.clone())
			.collect();
		affected.sort_by(|a, b| a.id().cmp(b.id()));

		let mut reverted = Vec::with_capacity(affected.len());
		for instruction in affected {
			let request = &instruction.request;
			self.bank
				.burn(
					ESCROW_ACCOUNT,
					&request.denom_trace.ibc_denom(),
					request.amount,
				)
				.await
				.map_err(|e| ForwardError::Escrow(e.to_string()))?;
			queue.remove(&request.id);
			if let Some(mut held) = self.instructions.get_mut(&request.id) {
				held.state = ForwardState::Reverted { at };
			}
			warn!(id = %request.id, source_height = request.source_height, "Held forward reverted");
			reverted.push(request.id.clone());
		}

		Ok(reverted)
	}

	pub fn get(&self, id: &str) -> Option<ForwardInstruction> {
		self.instructions.get(id).map(|i| i.clone())
	}

	pub fn list(&self) -> Vec<ForwardInstruction> {
		let mut instructions: Vec<_> = self.instructions.iter().map(|i| i.clone()).collect();
		instructions.sort_by(|a, b| (a.hold_until, a.id()).cmp(&(b.hold_until, b.id())));
		instructions
	}

	/// Number of instructions still held.
	pub fn held(&self) -> usize {
		self.instructions.iter().filter(|i| i.is_held()).count()
	}

	/// Ticks on every new hub height until shutdown is signalled or the
	/// height source goes away.
	pub async fn run(
		self: Arc<Self>,
		mut heights: watch::Receiver<Height>,
		mut shutdown: broadcast::Receiver<()>,
	) {
		info!("Forward controller started");
		loop {
			tokio::select! {
				changed = heights.changed() => {
					if changed.is_err() {
						debug!("Height source closed");
						break;
					}
					let height = *heights.borrow_and_update();
					let report = self.tick(height).await;
					if !report.is_empty() {
						debug!(height, sent = report.sent.len(), retrying = report.retrying.len(), "Forward tick");
					}
				}
				_ = shutdown.recv() => {
					info!("Forward controller received shutdown signal");
					break;
				}
			}
		}
	}

	// Releases escrow to the account the inbound packet named.
	async fn refund(&self, instruction: &ForwardInstruction) -> Result<(), ForwardError> {
		let request = &instruction.request;
		self.bank
			.send(
				ESCROW_ACCOUNT,
				&request.intermediate_receiver,
				&request.denom_trace.ibc_denom(),
				request.amount,
			)
			.await
			.map_err(|e| {
				error!(id = %request.id, error = %e, "Failed to release forward escrow");
				ForwardError::Escrow(e.to_string())
			})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use eibc_state::MemoryBank;
	use eibc_types::{DenomTrace, EibcError};
	use std::{sync::atomic::AtomicU32, time::Duration};

	/// Records sends; the first `fail_first` attempts fail.
	#[derive(Default)]
	struct RecordingTransport {
		fail_first: AtomicU32,
		sent: std::sync::Mutex<Vec<InstructionId>>,
	}

	#[async_trait]
	impl ForwardTransport for RecordingTransport {
		async fn send(&self, instruction: &ForwardInstruction) -> eibc_types::Result<PacketHandle> {
			if self
				.fail_first
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
				.is_ok()
			{
				return Err(EibcError::Chain("channel closed".into()));
			}
			let mut sent = self.sent.lock().unwrap();
			sent.push(instruction.id().to_string());
			Ok(PacketHandle {
				source_port: instruction.request.next_port.clone(),
				source_channel: instruction.request.next_channel.clone(),
				sequence: sent.len() as u64,
			})
		}
	}

	fn request(id: &str, retries: Option<u8>) -> ForwardRequest {
		ForwardRequest {
			id: id.to_string(),
			source: "rollappevm_1234-1".to_string(),
			source_height: 7,
			intermediate_receiver: "dym1hub".to_string(),
			receiver: "cosmos1dest".to_string(),
			next_port: "transfer".to_string(),
			next_channel: "channel-1".to_string(),
			timeout: Duration::from_secs(300),
			retries,
			next_memo: None,
			denom_trace: DenomTrace::parse("transfer/channel-0/urax"),
			amount: 1_000,
		}
	}

	fn setup(fail_first: u32) -> (Arc<RecordingTransport>, Arc<MemoryBank>, ForwardGraceController) {
		let transport = Arc::new(RecordingTransport {
			fail_first: AtomicU32::new(fail_first),
			..Default::default()
		});
		let bank = Arc::new(MemoryBank::new());
		let controller = ForwardGraceController::new(transport.clone(), bank.clone(), 2);
		(transport, bank, controller)
	}

	#[tokio::test]
	async fn test_forward_waits_for_grace_period() {
		let (transport, bank, controller) = setup(0);
		let denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();

		let handle = controller.schedule(request("a", None), 10, 100).await.unwrap();
		assert_eq!(handle.hold_until, 110);
		assert_eq!(bank.balance(ESCROW_ACCOUNT, &denom).await, 1_000);

		for height in [10, 50, 109] {
			assert!(controller.tick(height).await.is_empty());
		}
		assert!(transport.sent.lock().unwrap().is_empty());

		let report = controller.tick(110).await;
		assert_eq!(report.sent.len(), 1);
		assert!(matches!(
			controller.get("a").unwrap().state,
			ForwardState::Forwarded { at: 110, .. }
		));

		// Forwarded instructions are never attempted again.
		assert!(controller.tick(111).await.is_empty());
		assert_eq!(transport.sent.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_schedule_is_idempotent() {
		let (_, bank, controller) = setup(0);
		let denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();

		let first = controller.schedule(request("a", None), 10, 5).await.unwrap();
		let second = controller.schedule(request("a", None), 20, 5).await.unwrap();
		assert_eq!(first, second);
		assert_eq!(bank.balance(ESCROW_ACCOUNT, &denom).await, 1_000);
	}

	#[tokio::test]
	async fn test_cancel_before_hold_until_prevents_forward() {
		let (transport, bank, controller) = setup(0);
		let denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();

		let handle = controller.schedule(request("a", None), 0, 10).await.unwrap();
		controller.tick(5).await;
		let cancelled = controller.cancel(&handle).await.unwrap();
		assert!(matches!(cancelled.state, ForwardState::Cancelled { at: 5 }));

		assert!(controller.tick(10).await.is_empty());
		assert!(controller.tick(100).await.is_empty());
		assert!(transport.sent.lock().unwrap().is_empty());

		assert_eq!(bank.balance("dym1hub", &denom).await, 1_000);
		assert_eq!(bank.balance(ESCROW_ACCOUNT, &denom).await, 0);
		assert!(matches!(
			controller.cancel(&handle).await,
			Err(ForwardError::NotHeld { .. })
		));
	}

	#[tokio::test]
	async fn test_failed_sends_retry_after_interval() {
		let (transport, _, controller) = setup(1);
		controller.schedule(request("a", None), 0, 0).await.unwrap();

		let report = controller.tick(0).await;
		assert_eq!(report.retrying.len(), 1);
		let held = controller.get("a").unwrap();
		assert_eq!(held.next_attempt_at, 2);
		assert_eq!(held.last_error.as_deref(), Some("Chain error: channel closed"));

		assert!(controller.tick(1).await.is_empty());
		assert_eq!(controller.tick(2).await.sent.len(), 1);
		assert_eq!(controller.get("a").unwrap().attempts, 2);
		assert_eq!(transport.sent.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_exhausted_retries_release_to_intermediate_receiver() {
		let (_, bank, controller) = setup(10);
		let denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();
		controller.schedule(request("a", Some(1)), 0, 0).await.unwrap();

		assert_eq!(controller.tick(0).await.retrying.len(), 1);
		assert_eq!(controller.tick(2).await.failed.len(), 1);
		assert!(matches!(
			controller.get("a").unwrap().state,
			ForwardState::Failed { at: 2 }
		));
		assert_eq!(bank.balance("dym1hub", &denom).await, 1_000);
		assert_eq!(controller.held(), 0);
	}

	#[tokio::test]
	async fn test_cancel_keeps_instruction_held_when_escrow_is_missing() {
		let (transport, bank, controller) = setup(0);
		let denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();
		let handle = controller.schedule(request("a", None), 0, 10).await.unwrap();
		bank.burn(ESCROW_ACCOUNT, &denom, 1_000).await.unwrap();

		assert!(matches!(
			controller.cancel(&handle).await,
			Err(ForwardError::Escrow(_))
		));
		assert!(controller.get("a").unwrap().is_held());
		assert_eq!(bank.balance("dym1hub", &denom).await, 0);

		// Once the escrow is back the cancel goes through.
		bank.mint(ESCROW_ACCOUNT, &denom, 1_000).await.unwrap();
		let cancelled = controller.cancel(&handle).await.unwrap();
		assert!(matches!(cancelled.state, ForwardState::Cancelled { .. }));
		assert_eq!(bank.balance("dym1hub", &denom).await, 1_000);
		assert!(controller.tick(10).await.is_empty());
		assert!(transport.sent.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_exhausted_forward_stays_held_until_escrow_is_released() {
		let (_, bank, controller) = setup(10);
		let denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();
		controller.schedule(request("a", Some(0)), 0, 0).await.unwrap();
		bank.burn(ESCROW_ACCOUNT, &denom, 1_000).await.unwrap();

		let report = controller.tick(0).await;
		assert!(report.failed.is_empty());
		assert_eq!(report.retrying.len(), 1);
		let held = controller.get("a").unwrap();
		assert!(held.is_held());
		assert_eq!(held.next_attempt_at, 2);

		bank.mint(ESCROW_ACCOUNT, &denom, 1_000).await.unwrap();
		assert_eq!(controller.tick(2).await.failed.len(), 1);
		assert!(matches!(
			controller.get("a").unwrap().state,
			ForwardState::Failed { at: 2 }
		));
		assert_eq!(bank.balance("dym1hub", &denom).await, 1_000);
	}

	#[tokio::test]
	async fn test_revert_burns_held_forwards_from_reverted_heights() {
		let (transport, bank, controller) = setup(0);
		let denom = DenomTrace::parse("transfer/channel-0/urax").ibc_denom();

		let mut early = request("early", None);
		early.source_height = 3;
		let mut late = request("late", None);
		late.source_height = 8;
		let mut other = request("other", None);
		other.source = "rollappwasm_99-1".to_string();
		controller.schedule(early, 0, 10).await.unwrap();
		controller.schedule(late, 0, 10).await.unwrap();
		controller.schedule(other, 0, 10).await.unwrap();
		controller.tick(4).await;

		let reverted = controller.revert("rollappevm_1234-1", 5).await.unwrap();
		assert_eq!(reverted, vec!["late".to_string()]);
		assert!(matches!(
			controller.get("late").unwrap().state,
			ForwardState::Reverted { at: 4 }
		));
		assert_eq!(bank.balance(ESCROW_ACCOUNT, &denom).await, 2_000);

		let report = controller.tick(10).await;
		assert_eq!(report.sent.len(), 2);
		assert!(!transport.sent.lock().unwrap().contains(&"late".to_string()));
		assert!(controller.revert("rollappevm_1234-1", 5).await.unwrap().is_empty());
		assert!(matches!(
			controller.cancel(&ForwardHandle { id: "late".into(), hold_until: 10 }).await,
			Err(ForwardError::NotHeld { .. })
		));
	}

	#[tokio::test]
	async fn test_run_stops_on_shutdown() {
		let (transport, _, controller) = setup(0);
		let controller = Arc::new(controller);
		controller.schedule(request("a", None), 0, 3).await.unwrap();

		let (height_tx, height_rx) = watch::channel(0);
		let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
		let task = tokio::spawn(controller.clone().run(height_rx, shutdown_rx));

		height_tx.send(3).unwrap();
		for _ in 0..100 {
			if !transport.sent.lock().unwrap().is_empty() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		assert_eq!(transport.sent.lock().unwrap().len(), 1);

		shutdown_tx.send(()).unwrap();
		task.await.unwrap();
	}
}
