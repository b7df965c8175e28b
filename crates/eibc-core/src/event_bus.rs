//! Broadcast bus for engine events.
//!
//! Every state change the engine makes (orders created, fulfilled,
//! finalized or reverted, packets held or released, forwards sent or
//! cancelled) is published here for whoever is listening: the HTTP API,
//! logging, tests.

use eibc_types::EngineEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
	/// `capacity` events are buffered per subscriber; slow subscribers
	/// lose the oldest ones.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
		self.sender.subscribe()
	}

	/// Publishes to current subscribers. Having none is not an error.
	pub fn publish(&self, event: EngineEvent) {
		let _ = self.sender.send(event);
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use eibc_types::ForwardEvent;

	#[tokio::test]
	async fn test_subscribers_receive_published_events() {
		let bus = EventBus::new(8);
		bus.publish(EngineEvent::Forward(ForwardEvent::Cancelled { id: "lost".into() }));

		let mut rx = bus.subscribe();
		bus.clone()
			.publish(EngineEvent::Forward(ForwardEvent::Cancelled { id: "seen".into() }));

		match rx.recv().await.unwrap() {
			EngineEvent::Forward(ForwardEvent::Cancelled { id }) => assert_eq!(id, "seen"),
			other => panic!("unexpected event: {:?}", other),
		}
		assert_eq!(bus.subscriber_count(), 1);
	}
}
