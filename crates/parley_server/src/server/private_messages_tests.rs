#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{PeerId, Pseudonym};
use tokio::time::timeout;

use crate::server::bus::{EventBus, ServiceEvent};
use crate::server::messages::NextItem;
use crate::server::private_messages::PrivateMessageBroadcaster;
use crate::server::registry::ClientRegistry;

struct Rig {
	bus: EventBus,
	registry: Arc<ClientRegistry>,
	private_messages: Arc<PrivateMessageBroadcaster>,
}

fn rig() -> Rig {
	let registry = Arc::new(ClientRegistry::new());
	let private_messages = Arc::new(PrivateMessageBroadcaster::new(Arc::clone(&registry)));

	let bus = EventBus::new();
	bus.register(&registry);
	bus.register(&private_messages);

	Rig {
		bus,
		registry,
		private_messages,
	}
}

fn peer(addr: &str) -> PeerId {
	PeerId::new(addr).expect("valid PeerId")
}

fn name(s: &str) -> Pseudonym {
	Pseudonym::new(s).expect("valid Pseudonym")
}

impl Rig {
	fn connect(&self, peer: &PeerId, pseudonym: &Pseudonym) {
		self.bus.publish(&ServiceEvent::ClientConnected {
			peer: peer.clone(),
			pseudonym: pseudonym.clone(),
			gender: String::new(),
			country: String::new(),
		});
	}

	fn disconnect(&self, peer: &PeerId, pseudonym: &Pseudonym) {
		self.bus.publish(&ServiceEvent::ClientDisconnected {
			peer: peer.clone(),
			pseudonym: pseudonym.clone(),
			connection_duration: Duration::from_secs(1),
		});
	}

	fn send_private(&self, from: (&PeerId, &Pseudonym), to: (&PeerId, &Pseudonym), content: &str) {
		self.bus.publish(&ServiceEvent::PrivateMessageSent {
			sender_peer: from.0.clone(),
			sender_pseudonym: from.1.clone(),
			recipient_peer: to.0.clone(),
			recipient_pseudonym: to.1.clone(),
			content: content.to_string(),
		});
	}
}

#[tokio::test]
async fn delivered_to_recipient_only_and_at_most_once() {
	let rig = rig();
	let (pa, a) = (peer("ipv4:10.0.0.1:1000"), name("A"));
	let (pb, b) = (peer("ipv4:10.0.0.2:1000"), name("B"));
	let (pc, c) = (peer("ipv4:10.0.0.3:1000"), name("C"));

	for (p, n) in [(&pa, &a), (&pb, &b), (&pc, &c)] {
		rig.connect(p, n);
		assert!(rig.private_messages.normalize(p));
	}

	rig.send_private((&pa, &a), (&pb, &b), "secret");

	match rig.private_messages.next(&pb, Duration::ZERO).await {
		NextItem::Item(m) => {
			assert_eq!(m.author, a);
			assert_eq!(m.content, "secret");
			assert!(m.private);
		}
		other => panic!("expected the private message, got: {other:?}"),
	}

	// dequeued on delivery
	assert_eq!(rig.private_messages.next(&pb, Duration::ZERO).await, NextItem::Empty);

	// bystanders see nothing
	assert_eq!(rig.private_messages.next(&pa, Duration::ZERO).await, NextItem::Empty);
	assert_eq!(rig.private_messages.next(&pc, Duration::ZERO).await, NextItem::Empty);
}

#[tokio::test]
async fn queue_preserves_enqueue_order() {
	let rig = rig();
	let (pa, a) = (peer("ipv4:10.0.0.1:1000"), name("A"));
	let (pb, b) = (peer("ipv4:10.0.0.2:1000"), name("B"));
	rig.connect(&pa, &a);
	rig.connect(&pb, &b);

	rig.send_private((&pa, &a), (&pb, &b), "one");
	rig.send_private((&pa, &a), (&pb, &b), "two");

	let first = rig.private_messages.next(&pb, Duration::ZERO).await;
	let second = rig.private_messages.next(&pb, Duration::ZERO).await;

	match (first, second) {
		(NextItem::Item(m1), NextItem::Item(m2)) => {
			assert_eq!(m1.content, "one");
			assert_eq!(m2.content, "two");
		}
		other => panic!("expected two queued messages, got: {other:?}"),
	}
}

#[tokio::test]
async fn unregistered_peer_is_missing_and_queue_erased() {
	let rig = rig();
	let ghost = peer("ipv4:10.0.0.9:1000");

	assert!(!rig.private_messages.normalize(&ghost));
	assert_eq!(rig.private_messages.next(&ghost, Duration::ZERO).await, NextItem::PeerMissing);
}

#[tokio::test]
async fn disconnect_drops_undelivered_messages() {
	let rig = rig();
	let (pa, a) = (peer("ipv4:10.0.0.1:1000"), name("A"));
	let (pb, b) = (peer("ipv4:10.0.0.2:1000"), name("B"));
	rig.connect(&pa, &a);
	rig.connect(&pb, &b);

	rig.send_private((&pa, &a), (&pb, &b), "lost");
	rig.disconnect(&pb, &b);
	assert!(!rig.registry.is_peer_connected(&pb));

	// the queue was purged with the peer; reconnecting starts clean
	rig.connect(&pb, &b);
	assert!(rig.private_messages.normalize(&pb));
	assert_eq!(rig.private_messages.next(&pb, Duration::ZERO).await, NextItem::Empty);
}

#[tokio::test]
async fn waiting_recipient_wakes_on_send() {
	let rig = rig();
	let (pa, a) = (peer("ipv4:10.0.0.1:1000"), name("A"));
	let (pb, b) = (peer("ipv4:10.0.0.2:1000"), name("B"));
	rig.connect(&pa, &a);
	rig.connect(&pb, &b);
	assert!(rig.private_messages.normalize(&pb));

	let private_messages = Arc::clone(&rig.private_messages);
	let reader_peer = pb.clone();
	let reader = tokio::spawn(async move { private_messages.next(&reader_peer, Duration::from_millis(500)).await });

	tokio::time::sleep(Duration::from_millis(50)).await;
	rig.send_private((&pa, &a), (&pb, &b), "ping");

	let item = timeout(Duration::from_millis(300), reader)
		.await
		.expect("reader finished in time")
		.expect("reader task");

	match item {
		NextItem::Item(m) => assert_eq!(m.content, "ping"),
		other => panic!("expected the sent message, got: {other:?}"),
	}
}
