#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parley_domain::{ClientEventKind, ClientEventRecord, MessageRecord, PeerId, Pseudonym};
use parley_protocol::pb;
use thiserror::Error;
use tracing::{info, warn};

use crate::server::bus::{EventBus, ServiceEvent};
use crate::server::client_events::ClientEventBroadcaster;
use crate::server::connection::FrameWriter;
use crate::server::messages::{MessageBroadcaster, NextItem};
use crate::server::private_messages::PrivateMessageBroadcaster;
use crate::server::registry::ClientRegistry;
use crate::server::stats::StatisticsObserver;
use crate::server::validation::{ValidationChain, ValidationContext};

/// How long one bounded-wait read may block before the streaming loop
/// re-checks cancellation.
pub const STREAM_WAIT_QUANTUM: Duration = Duration::from_millis(200);

/// Rejection taxonomy of the facade; maps 1:1 onto wire status codes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
	#[error("{0}")]
	InvalidArgument(String),

	#[error("client not connected")]
	PermissionDenied,

	#[error("no connected client with pseudonym '{0}'")]
	NotFound(String),

	#[error("{0}")]
	ResourceExhausted(String),
}

impl ServiceError {
	pub fn status_code(&self) -> pb::StatusCode {
		match self {
			ServiceError::InvalidArgument(_) => pb::StatusCode::InvalidArgument,
			ServiceError::PermissionDenied => pb::StatusCode::PermissionDenied,
			ServiceError::NotFound(_) => pb::StatusCode::NotFound,
			ServiceError::ResourceExhausted(_) => pb::StatusCode::ResourceExhausted,
		}
	}
}

/// Endpoint handlers binding the transport to the core: registry lookups,
/// validation, event publishes and the streaming loops.
pub struct ChatService {
	registry: Arc<ClientRegistry>,
	messages: Arc<MessageBroadcaster>,
	private_messages: Arc<PrivateMessageBroadcaster>,
	client_events: Arc<ClientEventBroadcaster>,
	bus: EventBus,
	validation: ValidationChain,

	// the bus holds only weak references; these keep the observers alive
	// for the lifetime of the service
	#[allow(dead_code)]
	stats: Option<Arc<StatisticsObserver>>,
}

impl ChatService {
	/// Composition root: create every core component and register the
	/// observers. The registry goes first so membership is current when the
	/// broadcasters and the statistics observer see the same event.
	pub fn build(validation: ValidationChain, stats: Option<Arc<StatisticsObserver>>) -> Arc<Self> {
		let registry = Arc::new(ClientRegistry::new());
		let messages = Arc::new(MessageBroadcaster::new(Arc::clone(&registry)));
		let client_events = Arc::new(ClientEventBroadcaster::new(Arc::clone(&registry)));
		let private_messages = Arc::new(PrivateMessageBroadcaster::new(Arc::clone(&registry)));

		let bus = EventBus::new();
		bus.register(&registry);
		bus.register(&messages);
		if let Some(stats) = &stats {
			bus.register(stats);
		}
		bus.register(&client_events);
		bus.register(&private_messages);

		Arc::new(Self {
			registry,
			messages,
			private_messages,
			client_events,
			bus,
			validation,
			stats,
		})
	}

	pub fn registry(&self) -> &ClientRegistry {
		&self.registry
	}

	/// Register a pseudonym for `peer`. A rejected pseudonym is a
	/// business-level outcome, not a transport error: the call succeeds
	/// with `accepted = false` and publishes nothing.
	pub fn connect(&self, peer: &PeerId, request: pb::ConnectRequest) -> pb::ConnectResponse {
		let Ok(pseudonym) = Pseudonym::new(request.pseudonym.as_str()) else {
			return pb::ConnectResponse {
				accepted: false,
				message: "pseudonym is required".to_string(),
				connected_pseudonyms: Vec::new(),
			};
		};

		if !self.registry.is_pseudonym_available(peer, &pseudonym) {
			metrics::counter!("parley_server_connect_rejected_total").increment(1);
			info!(peer = %peer, pseudonym = %pseudonym, "connect rejected: pseudonym already in use");
			return pb::ConnectResponse {
				accepted: false,
				message: "The pseudonym you chose is already in use, please choose another one".to_string(),
				connected_pseudonyms: Vec::new(),
			};
		}

		let message = format!("New client '{pseudonym}' is now connected");
		let roster = self
			.registry
			.connected_pseudonyms()
			.into_iter()
			.map(Pseudonym::into_string)
			.collect();

		self.bus.publish(&ServiceEvent::ClientConnected {
			peer: peer.clone(),
			pseudonym: pseudonym.clone(),
			gender: request.gender,
			country: request.country,
		});

		metrics::counter!("parley_server_connects_total").increment(1);
		info!(peer = %peer, pseudonym = %pseudonym, "client connected");

		pb::ConnectResponse {
			accepted: true,
			message,
			connected_pseudonyms: roster,
		}
	}

	/// Advisory disconnect notice. Idempotent: an unknown peer or pseudonym
	/// is a no-op and publishes nothing.
	pub fn disconnect(&self, peer: &PeerId, request: pb::DisconnectRequest) {
		let Ok(pseudonym) = Pseudonym::new(request.pseudonym.as_str()) else {
			return;
		};

		// duration must be read before the registry drops the entry
		let Some(connection_duration) = self.registry.connection_duration(peer) else {
			return;
		};

		self.bus.publish(&ServiceEvent::ClientDisconnected {
			peer: peer.clone(),
			pseudonym: pseudonym.clone(),
			connection_duration,
		});

		metrics::counter!("parley_server_disconnects_total").increment(1);
		info!(peer = %peer, pseudonym = %pseudonym, duration_secs = connection_duration.as_secs(), "client disconnected");
	}

	/// Validate and publish one message, to the room or to a single named
	/// recipient.
	pub fn send_message(&self, peer: &PeerId, request: pb::SendMessageRequest) -> Result<(), ServiceError> {
		if request.content.is_empty() {
			return Err(ServiceError::InvalidArgument("message content is required".to_string()));
		}

		let pseudonym = self
			.registry
			.pseudonym_for_peer(peer)
			.ok_or(ServiceError::PermissionDenied)?;

		let ctx = ValidationContext {
			peer,
			pseudonym: &pseudonym,
			content: &request.content,
			timestamp: Instant::now(),
		};

		if let Err(rejection) = self.validation.validate(&ctx) {
			metrics::counter!("parley_server_validation_failures_total").increment(1);
			warn!(pseudonym = %pseudonym, error = %rejection, "message validation failed");
			return Err(rejection);
		}

		match request.private_recipient {
			None => {
				info!(pseudonym = %pseudonym, "room message");
				metrics::counter!("parley_server_messages_total").increment(1);

				self.bus.publish(&ServiceEvent::MessageSent {
					peer: peer.clone(),
					pseudonym,
					content: request.content,
				});
				Ok(())
			}
			Some(recipient) => {
				let recipient_pseudonym =
					Pseudonym::new(recipient.as_str()).map_err(|_| ServiceError::NotFound(recipient.clone()))?;
				let recipient_peer = self
					.registry
					.peer_for_pseudonym(&recipient_pseudonym)
					.ok_or_else(|| ServiceError::NotFound(recipient_pseudonym.to_string()))?;

				info!(pseudonym = %pseudonym, recipient = %recipient_pseudonym, "private message");
				metrics::counter!("parley_server_private_messages_total").increment(1);

				self.bus.publish(&ServiceEvent::PrivateMessageSent {
					sender_peer: peer.clone(),
					sender_pseudonym: pseudonym,
					recipient_peer,
					recipient_pseudonym,
					content: request.content,
				});
				Ok(())
			}
		}
	}

	/// Room message stream: no history replay, then one frame per new
	/// message until cancellation or the peer drops out of the registry.
	pub async fn subscribe_messages(&self, peer: &PeerId, cancelled: &AtomicBool, writer: &mut FrameWriter) -> pb::Reply {
		if !self.messages.normalize_cursor(peer) {
			return pb::Reply::with_status(pb::StatusCode::PermissionDenied, "client not connected");
		}

		loop {
			if cancelled.load(Ordering::Relaxed) {
				return pb::Reply::with_status(pb::StatusCode::Cancelled, "stream cancelled by client");
			}

			match self.messages.next(peer, STREAM_WAIT_QUANTUM).await {
				NextItem::PeerMissing => {
					return pb::Reply::with_status(pb::StatusCode::PermissionDenied, "client not connected");
				}
				NextItem::Empty => continue,
				NextItem::Item(record) => {
					let frame = pb::ServerFrame::message(chat_message_frame(record));
					if writer.write(&frame).await.is_err() {
						return pb::Reply::with_status(pb::StatusCode::Unknown, "failed to write to client stream");
					}
				}
			}
		}
	}

	/// Membership stream: one synthetic SYNC frame carrying the roster,
	/// then ADD/REMOVE deltas as they happen. The SYNC baseline replaces
	/// any replay of historical deltas.
	pub async fn subscribe_client_events(
		&self,
		peer: &PeerId,
		cancelled: &AtomicBool,
		writer: &mut FrameWriter,
	) -> pb::Reply {
		if !self.registry.is_peer_connected(peer) {
			return pb::Reply::with_status(pb::StatusCode::PermissionDenied, "client not connected");
		}

		let roster = ClientEventRecord::sync(self.registry.connected_pseudonyms());
		if writer.write(&pb::ServerFrame::client_event(client_event_frame(roster))).await.is_err() {
			return pb::Reply::with_status(pb::StatusCode::Unknown, "failed to write initial roster");
		}

		if !self.client_events.normalize_cursor(peer) {
			return pb::Reply::with_status(pb::StatusCode::PermissionDenied, "client not connected");
		}

		loop {
			if cancelled.load(Ordering::Relaxed) {
				return pb::Reply::with_status(pb::StatusCode::Cancelled, "stream cancelled by client");
			}

			match self.client_events.next(peer, STREAM_WAIT_QUANTUM).await {
				NextItem::PeerMissing => {
					return pb::Reply::with_status(pb::StatusCode::PermissionDenied, "client not connected");
				}
				NextItem::Empty => continue,
				NextItem::Item(record) => {
					let frame = pb::ServerFrame::client_event(client_event_frame(record));
					if writer.write(&frame).await.is_err() {
						return pb::Reply::with_status(pb::StatusCode::Unknown, "failed to write to client stream");
					}
				}
			}
		}
	}

	/// Private message stream: no initial snapshot, queued messages are
	/// delivered at most once.
	pub async fn subscribe_private_messages(
		&self,
		peer: &PeerId,
		cancelled: &AtomicBool,
		writer: &mut FrameWriter,
	) -> pb::Reply {
		if !self.private_messages.normalize(peer) {
			return pb::Reply::with_status(pb::StatusCode::PermissionDenied, "client not connected");
		}

		loop {
			if cancelled.load(Ordering::Relaxed) {
				return pb::Reply::with_status(pb::StatusCode::Cancelled, "stream cancelled by client");
			}

			match self.private_messages.next(peer, STREAM_WAIT_QUANTUM).await {
				NextItem::PeerMissing => {
					return pb::Reply::with_status(pb::StatusCode::PermissionDenied, "client not connected");
				}
				NextItem::Empty => continue,
				NextItem::Item(record) => {
					let frame = pb::ServerFrame::message(chat_message_frame(record));
					if writer.write(&frame).await.is_err() {
						return pb::Reply::with_status(pb::StatusCode::Unknown, "failed to write to client stream");
					}
				}
			}
		}
	}
}

fn chat_message_frame(record: MessageRecord) -> pb::ChatMessage {
	pb::ChatMessage {
		author: record.author.into_string(),
		content: record.content,
		is_private: record.private,
	}
}

fn client_event_frame(record: ClientEventRecord) -> pb::ClientEvent {
	let kind = match record.kind {
		ClientEventKind::Add => pb::ClientEventKind::Add,
		ClientEventKind::Remove => pb::ClientEventKind::Remove,
		ClientEventKind::Sync => pb::ClientEventKind::Sync,
	};

	pb::ClientEvent {
		kind: kind as i32,
		pseudonyms: record.pseudonyms.into_iter().map(Pseudonym::into_string).collect(),
	}
}
