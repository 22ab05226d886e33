#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parley_domain::{PeerId, Pseudonym};

use crate::server::bus::{ServiceEvent, ServiceEventObserver};

/// Everything the server keeps about one registered peer.
#[derive(Debug, Clone)]
struct ClientInfo {
	pseudonym: Pseudonym,
	#[allow(dead_code)]
	gender: String,
	#[allow(dead_code)]
	country: String,
	connected_at: Instant,
}

/// Authoritative peer ↔ pseudonym membership map.
///
/// Mutates itself from bus events only; the facade talks to it through the
/// read-side queries. It is registered first on the bus so every other
/// observer sees post-mutation membership when reacting to the same event.
#[derive(Default)]
pub struct ClientRegistry {
	clients: Mutex<HashMap<PeerId, ClientInfo>>,
}

impl ClientRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// False iff some *other* registered peer holds `pseudonym`. A peer
	/// re-registering under its own pseudonym is not a conflict.
	pub fn is_pseudonym_available(&self, peer: &PeerId, pseudonym: &Pseudonym) -> bool {
		let clients = self.clients.lock();
		!clients
			.iter()
			.any(|(other, info)| other != peer && info.pseudonym == *pseudonym)
	}

	pub fn pseudonym_for_peer(&self, peer: &PeerId) -> Option<Pseudonym> {
		self.clients.lock().get(peer).map(|info| info.pseudonym.clone())
	}

	pub fn peer_for_pseudonym(&self, pseudonym: &Pseudonym) -> Option<PeerId> {
		let clients = self.clients.lock();
		clients
			.iter()
			.find(|(_, info)| info.pseudonym == *pseudonym)
			.map(|(peer, _)| peer.clone())
	}

	/// Elapsed time since the peer registered, or `None` if unknown.
	pub fn connection_duration(&self, peer: &PeerId) -> Option<Duration> {
		self.clients.lock().get(peer).map(|info| info.connected_at.elapsed())
	}

	/// Roster snapshot, unspecified order.
	pub fn connected_pseudonyms(&self) -> Vec<Pseudonym> {
		let clients = self.clients.lock();
		clients.values().map(|info| info.pseudonym.clone()).collect()
	}

	pub fn is_peer_connected(&self, peer: &PeerId) -> bool {
		self.clients.lock().contains_key(peer)
	}
}

impl ServiceEventObserver for ClientRegistry {
	fn handle(&self, event: &ServiceEvent) {
		match event {
			ServiceEvent::ClientConnected {
				peer,
				pseudonym,
				gender,
				country,
			} => {
				let info = ClientInfo {
					pseudonym: pseudonym.clone(),
					gender: gender.clone(),
					country: country.clone(),
					connected_at: Instant::now(),
				};

				// re-registering the same peer overwrites its entry
				self.clients.lock().insert(peer.clone(), info);
			}
			ServiceEvent::ClientDisconnected { pseudonym, .. } => {
				let mut clients = self.clients.lock();
				let found = clients
					.iter()
					.find(|(_, info)| info.pseudonym == *pseudonym)
					.map(|(peer, _)| peer.clone());

				if let Some(peer) = found {
					clients.remove(&peer);
				}
			}
			ServiceEvent::MessageSent { .. } | ServiceEvent::PrivateMessageSent { .. } => {}
		}
	}
}
