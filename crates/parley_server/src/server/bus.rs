#![forbid(unsafe_code)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use parley_domain::{PeerId, Pseudonym};

/// Domain events published by the service facade.
///
/// One tagged variant instead of one hook method per event: observers that
/// care about a single variant ignore the rest.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
	ClientConnected {
		peer: PeerId,
		pseudonym: Pseudonym,
		gender: String,
		country: String,
	},
	ClientDisconnected {
		peer: PeerId,
		pseudonym: Pseudonym,
		connection_duration: Duration,
	},
	MessageSent {
		peer: PeerId,
		pseudonym: Pseudonym,
		content: String,
	},
	PrivateMessageSent {
		sender_peer: PeerId,
		sender_pseudonym: Pseudonym,
		recipient_peer: PeerId,
		recipient_pseudonym: Pseudonym,
		content: String,
	},
}

/// A bus subscriber. Hooks run synchronously on the publisher's task and
/// must only take their own component's lock; they never call back into
/// the bus.
pub trait ServiceEventObserver: Send + Sync {
	fn handle(&self, event: &ServiceEvent);
}

/// In-process fan-out of [`ServiceEvent`]s to registered observers.
///
/// Observers are held weakly and invoked in registration order; an expired
/// observer is pruned during publish. Registering the same observer twice
/// delivers each event once per registration.
#[derive(Default)]
pub struct EventBus {
	observers: Mutex<Vec<Weak<dyn ServiceEventObserver>>>,
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Append an observer. Registration order is delivery order, which is
	/// how the registry gets to update membership before anyone else reacts
	/// to the same event.
	pub fn register<O>(&self, observer: &Arc<O>)
	where
		O: ServiceEventObserver + 'static,
	{
		let observer: Arc<O> = Arc::clone(observer);
		let observer: Arc<dyn ServiceEventObserver> = observer;
		self.observers.lock().push(Arc::downgrade(&observer));
	}

	/// Deliver `event` to every live observer, in order, under the bus lock.
	pub fn publish(&self, event: &ServiceEvent) {
		let mut observers = self.observers.lock();
		observers.retain(|weak| match weak.upgrade() {
			Some(observer) => {
				observer.handle(event);
				true
			}
			None => false,
		});
	}

	/// Number of live registrations.
	pub fn observer_count(&self) -> usize {
		self.observers.lock().iter().filter(|weak| weak.strong_count() > 0).count()
	}
}
