#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_domain::{ClientEventKind, ClientEventRecord, PeerId, Pseudonym};
use tokio::sync::Notify;

use crate::server::bus::{ServiceEvent, ServiceEventObserver};
use crate::server::messages::NextItem;
use crate::server::registry::ClientRegistry;

#[derive(Default)]
struct Inner {
	events: Vec<ClientEventRecord>,
	cursors: HashMap<PeerId, usize>,
}

/// Append-only log of join/leave deltas with one read cursor per peer.
///
/// Same monitor shape as the message broadcaster; the synthetic SYNC roster
/// frame is the facade's business and never lands in this log.
pub struct ClientEventBroadcaster {
	registry: Arc<ClientRegistry>,
	inner: Mutex<Inner>,
	grew: Notify,
}

impl ClientEventBroadcaster {
	pub fn new(registry: Arc<ClientRegistry>) -> Self {
		Self {
			registry,
			inner: Mutex::new(Inner::default()),
			grew: Notify::new(),
		}
	}

	fn append(&self, kind: ClientEventKind, pseudonym: Pseudonym) {
		{
			let mut inner = self.inner.lock();
			inner.events.push(ClientEventRecord::delta(kind, pseudonym));
		}

		self.grew.notify_waiters();
	}

	/// Erase-and-refuse for unregistered peers, initialize at the log end
	/// for first-time readers, clamp otherwise.
	pub fn normalize_cursor(&self, peer: &PeerId) -> bool {
		let mut inner = self.inner.lock();

		if !self.registry.is_peer_connected(peer) {
			inner.cursors.remove(peer);
			return false;
		}

		let end = inner.events.len();
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

	/// Return the peer's next undelivered event, waiting up to `wait_for`
	/// for the log to grow.
	pub async fn next(&self, peer: &PeerId, wait_for: Duration) -> NextItem<ClientEventRecord> {
		let mut notified = pin!(self.grew.notified());

		{
			let mut inner = self.inner.lock();

			if !self.registry.is_peer_connected(peer) {
				inner.cursors.remove(peer);
				return NextItem::PeerMissing;
			}

			let end = inner.events.len();
			let cursor = *inner.cursors.entry(peer.clone()).or_insert(end);
			if cursor < end {
				let record = inner.events[cursor].clone();
				inner.cursors.insert(peer.clone(), cursor + 1);
				return NextItem::Item(record);
			}

			notified.as_mut().enable();
		}

		let _ = tokio::time::timeout(wait_for, notified).await;

		let mut inner = self.inner.lock();

		if !self.registry.is_peer_connected(peer) {
			inner.cursors.remove(peer);
			return NextItem::PeerMissing;
		}

		let Some(cursor) = inner.cursors.get(peer).copied() else {
			return NextItem::PeerMissing;
		};

		if cursor < inner.events.len() {
			let record = inner.events[cursor].clone();
			inner.cursors.insert(peer.clone(), cursor + 1);
			return NextItem::Item(record);
		}

		NextItem::Empty
	}
}

impl ServiceEventObserver for ClientEventBroadcaster {
	fn handle(&self, event: &ServiceEvent) {
		match event {
			ServiceEvent::ClientConnected { pseudonym, .. } => {
				self.append(ClientEventKind::Add, pseudonym.clone());
			}
			ServiceEvent::ClientDisconnected { pseudonym, .. } => {
				self.append(ClientEventKind::Remove, pseudonym.clone());
			}
			ServiceEvent::MessageSent { .. } | ServiceEvent::PrivateMessageSent { .. } => {}
		}
	}
}
