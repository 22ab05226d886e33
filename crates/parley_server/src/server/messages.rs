#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_domain::{MessageRecord, PeerId};
use tokio::sync::Notify;

use crate::server::bus::{ServiceEvent, ServiceEventObserver};
use crate::server::registry::ClientRegistry;

/// Outcome of a bounded-wait read against a broadcaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextItem<T> {
	/// The next undelivered record; the caller's cursor has advanced past it.
	Item(T),
	/// Nothing new within the wait budget.
	Empty,
	/// The peer is no longer registered; its read state has been erased.
	PeerMissing,
}

#[derive(Default)]
struct Inner {
	history: Vec<MessageRecord>,
	cursors: HashMap<PeerId, usize>,
}

/// Append-only history of room messages with one read cursor per peer.
///
/// History and cursors live under a single lock so a reader observes both
/// consistently; `grew` stands in for the condition variable signalled on
/// every append. Waiters arm their wakeup while still holding the lock,
/// which closes the window where an append could slip by unnoticed.
pub struct MessageBroadcaster {
	registry: Arc<ClientRegistry>,
	inner: Mutex<Inner>,
	grew: Notify,
}

impl MessageBroadcaster {
	pub fn new(registry: Arc<ClientRegistry>) -> Self {
		Self {
			registry,
			inner: Mutex::new(Inner::default()),
			grew: Notify::new(),
		}
	}

	/// Prepare the peer's cursor for streaming: erase it and report `false`
	/// when the peer is unregistered, initialize it at the history end when
	/// absent (no replay of older messages), clamp it otherwise.
	pub fn normalize_cursor(&self, peer: &PeerId) -> bool {
		let mut inner = self.inner.lock();

		if !self.registry.is_peer_connected(peer) {
			inner.cursors.remove(peer);
			return false;
		}

		let end = inner.history.len();
		match inner.cursors.get_mut(peer) {
			Some(cursor) => {
				if *cursor > end {
					*cursor = end;
				}
			}
			None => {
				inner.cursors.insert(peer.clone(), end);
			}
		}

		true
	}

	/// Return the peer's next undelivered message, waiting up to `wait_for`
	/// for the history to grow.
	pub async fn next(&self, peer: &PeerId, wait_for: Duration) -> NextItem<MessageRecord> {
		let mut notified = pin!(self.grew.notified());

		{
			let mut inner = self.inner.lock();

			if !self.registry.is_peer_connected(peer) {
				inner.cursors.remove(peer);
				return NextItem::PeerMissing;
			}

			let end = inner.history.len();
			let cursor = *inner.cursors.entry(peer.clone()).or_insert(end);
			if cursor < end {
				let record = inner.history[cursor].clone();
				inner.cursors.insert(peer.clone(), cursor + 1);
				return NextItem::Item(record);
			}

			notified.as_mut().enable();
		}

		let _ = tokio::time::timeout(wait_for, notified).await;

		let mut inner = self.inner.lock();

		// the peer may have disconnected while we slept
		if !self.registry.is_peer_connected(peer) {
			inner.cursors.remove(peer);
			return NextItem::PeerMissing;
		}

		let Some(cursor) = inner.cursors.get(peer).copied() else {
			return NextItem::PeerMissing;
		};

		if cursor < inner.history.len() {
			let record = inner.history[cursor].clone();
			inner.cursors.insert(peer.clone(), cursor + 1);
			return NextItem::Item(record);
		}

		NextItem::Empty
	}
}

impl ServiceEventObserver for MessageBroadcaster {
	fn handle(&self, event: &ServiceEvent) {
		if let ServiceEvent::MessageSent { pseudonym, content, .. } = event {
			let record = MessageRecord::broadcast(pseudonym.clone(), content.clone());

			{
				let mut inner = self.inner.lock();
				inner.history.push(record);
			}

			self.grew.notify_waiters();
		}
	}
}
