#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_domain::{MessageRecord, PeerId};
use tokio::sync::Notify;

use crate::server::bus::{ServiceEvent, ServiceEventObserver};
use crate::server::messages::NextItem;
use crate::server::registry::ClientRegistry;

/// Per-recipient FIFO queues of directed messages.
///
/// Unlike the room history there is nothing to replay and nothing to keep:
/// a record lives in exactly one recipient's queue and is dropped on
/// delivery, so memory is freed as soon as the recipient reads it. Queues
/// of departed peers are purged on disconnect; their undelivered messages
/// are lost.
pub struct PrivateMessageBroadcaster {
	registry: Arc<ClientRegistry>,
	queues: Mutex<HashMap<PeerId, VecDeque<MessageRecord>>>,
	grew: Notify,
}

impl PrivateMessageBroadcaster {
	pub fn new(registry: Arc<ClientRegistry>) -> Self {
		Self {
			registry,
			queues: Mutex::new(HashMap::new()),
			grew: Notify::new(),
		}
	}

	/// Ensure an (empty) queue exists for a registered peer; erase the
	/// queue and report `false` when the peer is unregistered.
	pub fn normalize(&self, peer: &PeerId) -> bool {
		let mut queues = self.queues.lock();

		if !self.registry.is_peer_connected(peer) {
			queues.remove(peer);
			return false;
		}

		queues.entry(peer.clone()).or_default();
		true
	}

	/// Pop the peer's oldest undelivered message, waiting up to `wait_for`
	/// for one to arrive.
	pub async fn next(&self, peer: &PeerId, wait_for: Duration) -> NextItem<MessageRecord> {
		let mut notified = pin!(self.grew.notified());

		{
			let mut queues = self.queues.lock();

			if !self.registry.is_peer_connected(peer) {
				queues.remove(peer);
				return NextItem::PeerMissing;
			}

			let queue = queues.entry(peer.clone()).or_default();
			if let Some(record) = queue.pop_front() {
				return NextItem::Item(record);
			}

			notified.as_mut().enable();
		}

		let _ = tokio::time::timeout(wait_for, notified).await;

		let mut queues = self.queues.lock();

		if !self.registry.is_peer_connected(peer) {
			queues.remove(peer);
			return NextItem::PeerMissing;
		}

		match queues.get_mut(peer).and_then(|queue| queue.pop_front()) {
			Some(record) => NextItem::Item(record),
			None => NextItem::Empty,
		}
	}
}

impl ServiceEventObserver for PrivateMessageBroadcaster {
	fn handle(&self, event: &ServiceEvent) {
		match event {
			ServiceEvent::PrivateMessageSent {
				sender_pseudonym,
				recipient_peer,
				content,
				..
			} => {
				let record = MessageRecord::direct(sender_pseudonym.clone(), content.clone());

				{
					let mut queues = self.queues.lock();
					queues.entry(recipient_peer.clone()).or_default().push_back(record);
				}

				self.grew.notify_waiters();
			}
			ServiceEvent::ClientDisconnected { .. } => {
				// the registry has already dropped the peer; sweep queues
				// whose owner is gone
				let mut queues = self.queues.lock();
				queues.retain(|peer, _| self.registry.is_peer_connected(peer));
			}
			ServiceEvent::ClientConnected { .. } | ServiceEvent::MessageSent { .. } => {}
		}
	}
}
