#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, encode_frame, pb, try_decode_frame_from_buffer, version};
use parley_server::quic::config::QuicServerConfig;
use parley_server::server::connection::{ConnectionSettings, serve};
use parley_server::server::service::ChatService;
use parley_server::server::validation::{ContentValidator, RateLimitValidator, ValidationChain};
use tokio::time::timeout;

static CRYPTO_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto() {
	CRYPTO_INIT.get_or_init(|| {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
	});
}

struct TestServer {
	addr: SocketAddr,
	cert_der: Vec<u8>,
	handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

/// Bind a dev endpoint on a free port and serve the given service.
fn start_server(validation: ValidationChain) -> anyhow::Result<TestServer> {
	init_crypto();

	let service = ChatService::build(validation, None);

	let bind: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let (endpoint, cert_der) = QuicServerConfig::dev(bind).bind_dev_endpoint()?;
	let addr = endpoint.local_addr().context("server local_addr")?;

	let handle = tokio::spawn(serve(endpoint, service, ConnectionSettings::default()));

	Ok(TestServer { addr, cert_der, handle })
}

/// Permissive chain for the delivery scenarios (single-byte payloads, rapid
/// sends); the rate-limit scenario builds its own chain.
fn permissive_validation() -> ValidationChain {
	ValidationChain::new().with(ContentValidator::new(1, 300))
}

struct TestClient {
	// keeps the client endpoint alive for the connection's lifetime
	_endpoint: quinn::Endpoint,
	connection: quinn::Connection,
}

struct Subscription {
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
}

impl TestClient {
	async fn connect_transport(server: &TestServer) -> anyhow::Result<Self> {
		let mut roots = rustls::RootCertStore::empty();
		roots
			.add(rustls::pki_types::CertificateDer::from(server.cert_der.clone()))
			.context("trust dev cert")?;

		let mut tls = rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		tls.alpn_protocols = vec![version::ALPN.to_vec()];

		let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).context("client crypto")?;
		let client_config = quinn::ClientConfig::new(Arc::new(quic_tls));

		let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().context("client bind")?)?;
		endpoint.set_default_client_config(client_config);

		let connection = endpoint
			.connect(server.addr, "localhost")
			.context("connect")?
			.await
			.context("establish connection")?;

		Ok(Self {
			_endpoint: endpoint,
			connection,
		})
	}

	/// One request, one reply, stream closed.
	async fn unary(&self, body: pb::request::Body) -> anyhow::Result<pb::Reply> {
		let (mut send, mut recv) = self.connection.open_bi().await.context("open_bi")?;

		let frame = encode_frame(&pb::Request { body: Some(body) }, DEFAULT_MAX_FRAME_SIZE)?;
		send.write_all(&frame).await.context("write request")?;
		send.finish().context("finish request stream")?;

		let mut buf = BytesMut::new();
		let mut tmp = [0u8; 8192];
		loop {
			if let Some(frame) = try_decode_frame_from_buffer::<pb::ServerFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE)? {
				return match frame.msg {
					Some(pb::server_frame::Msg::Reply(reply)) => Ok(reply),
					other => Err(anyhow!("expected Reply frame, got: {other:?}")),
				};
			}

			match recv.read(&mut tmp).await.context("read reply")? {
				Some(n) => buf.extend_from_slice(&tmp[..n]),
				None => return Err(anyhow!("stream closed before a reply frame")),
			}
		}
	}

	async fn connect_chat(&self, pseudonym: &str) -> anyhow::Result<pb::ConnectResponse> {
		let reply = self
			.unary(pb::request::Body::Connect(pb::ConnectRequest {
				pseudonym: pseudonym.to_string(),
				gender: "X".to_string(),
				country: "FR".to_string(),
			}))
			.await?;

		reply.connect.ok_or_else(|| anyhow!("Connect reply carried no payload"))
	}

	async fn send_message(&self, content: &str, recipient: Option<&str>) -> anyhow::Result<pb::Reply> {
		self.unary(pb::request::Body::SendMessage(pb::SendMessageRequest {
			content: content.to_string(),
			private_recipient: recipient.map(str::to_string),
		}))
		.await
	}

	/// Open a streaming RPC; the send half stays open until `cancel`.
	async fn subscribe(&self, body: pb::request::Body) -> anyhow::Result<Subscription> {
		let (mut send, recv) = self.connection.open_bi().await.context("open_bi")?;

		let frame = encode_frame(&pb::Request { body: Some(body) }, DEFAULT_MAX_FRAME_SIZE)?;
		send.write_all(&frame).await.context("write subscribe request")?;

		Ok(Subscription {
			send,
			recv,
			buf: BytesMut::new(),
		})
	}
}

impl Subscription {
	/// Read the next frame, or `None` when `wait` elapses first.
	async fn next_frame(&mut self, wait: Duration) -> anyhow::Result<Option<pb::ServerFrame>> {
		let deadline = tokio::time::Instant::now() + wait;
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(frame) = try_decode_frame_from_buffer::<pb::ServerFrame>(&mut self.buf, DEFAULT_MAX_FRAME_SIZE)? {
				return Ok(Some(frame));
			}

			match tokio::time::timeout_at(deadline, self.recv.read(&mut tmp)).await {
				Err(_) => return Ok(None),
				Ok(Ok(Some(n))) => self.buf.extend_from_slice(&tmp[..n]),
				Ok(Ok(None)) => return Err(anyhow!("stream finished without a terminal reply")),
				Ok(Err(e)) => return Err(anyhow!(e).context("subscription read failed")),
			}
		}
	}

	async fn expect_message(&mut self, wait: Duration) -> anyhow::Result<pb::ChatMessage> {
		match self.next_frame(wait).await? {
			Some(pb::ServerFrame {
				msg: Some(pb::server_frame::Msg::Message(message)),
			}) => Ok(message),
			other => Err(anyhow!("expected a chat message frame, got: {other:?}")),
		}
	}

	async fn expect_client_event(&mut self, wait: Duration) -> anyhow::Result<pb::ClientEvent> {
		match self.next_frame(wait).await? {
			Some(pb::ServerFrame {
				msg: Some(pb::server_frame::Msg::ClientEvent(event)),
			}) => Ok(event),
			other => Err(anyhow!("expected a client event frame, got: {other:?}")),
		}
	}

	/// Half-close the request side; the server treats this as cancellation.
	fn cancel(&mut self) {
		let _ = self.send.finish();
	}
}

/// Subscriptions are processed asynchronously; give the server a moment to
/// run `normalize` before publishing anything the test depends on.
async fn settle() {
	tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_messages_arrive_in_order_for_every_subscriber() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let alice = TestClient::connect_transport(&server).await?;
	let bob = TestClient::connect_transport(&server).await?;

	assert!(alice.connect_chat("A").await?.accepted);
	assert!(bob.connect_chat("B").await?.accepted);

	let mut sub_a = alice.subscribe(pb::request::Body::SubscribeMessages(Default::default())).await?;
	let mut sub_b = bob.subscribe(pb::request::Body::SubscribeMessages(Default::default())).await?;
	settle().await;

	assert_eq!(alice.send_message("hi", None).await?.status(), pb::StatusCode::Ok);
	assert_eq!(alice.send_message("bye", None).await?.status(), pb::StatusCode::Ok);

	for sub in [&mut sub_a, &mut sub_b] {
		let first = sub.expect_message(Duration::from_secs(2)).await?;
		assert_eq!(first.author, "A");
		assert_eq!(first.content, "hi");
		assert!(!first.is_private);

		let second = sub.expect_message(Duration::from_secs(2)).await?;
		assert_eq!(second.author, "A");
		assert_eq!(second.content, "bye");
	}

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_receives_no_history() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let alice = TestClient::connect_transport(&server).await?;
	assert!(alice.connect_chat("A").await?.accepted);
	assert_eq!(alice.send_message("x", None).await?.status(), pb::StatusCode::Ok);

	let bob = TestClient::connect_transport(&server).await?;
	assert!(bob.connect_chat("B").await?.accepted);
	let mut sub_b = bob.subscribe(pb::request::Body::SubscribeMessages(Default::default())).await?;
	settle().await;

	assert!(
		sub_b.next_frame(Duration::from_millis(100)).await?.is_none(),
		"late joiner must not replay history"
	);

	assert_eq!(alice.send_message("y", None).await?.status(), pb::StatusCode::Ok);

	let delivered = sub_b.expect_message(Duration::from_secs(2)).await?;
	assert_eq!(delivered.author, "A");
	assert_eq!(delivered.content, "y");

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_pseudonym_is_rejected_without_an_event() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let alice = TestClient::connect_transport(&server).await?;
	assert!(alice.connect_chat("alice").await?.accepted);

	let mut events = alice
		.subscribe(pb::request::Body::SubscribeClientEvents(Default::default()))
		.await?;
	let sync = events.expect_client_event(Duration::from_secs(2)).await?;
	assert_eq!(sync.kind(), pb::ClientEventKind::Sync);
	assert_eq!(sync.pseudonyms, vec!["alice".to_string()]);

	let impostor = TestClient::connect_transport(&server).await?;
	let response = impostor.connect_chat("alice").await?;
	assert!(!response.accepted);
	assert!(response.message.contains("already in use"));

	assert!(
		events.next_frame(Duration::from_millis(400)).await?.is_none(),
		"a rejected connect must not publish a client event"
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_events_report_joins_and_leaves() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let alice = TestClient::connect_transport(&server).await?;
	assert!(alice.connect_chat("alice").await?.accepted);

	let mut events = alice
		.subscribe(pb::request::Body::SubscribeClientEvents(Default::default()))
		.await?;

	let sync = events.expect_client_event(Duration::from_secs(2)).await?;
	assert_eq!(sync.kind(), pb::ClientEventKind::Sync);

	let bob = TestClient::connect_transport(&server).await?;
	assert!(bob.connect_chat("bob").await?.accepted);

	let added = events.expect_client_event(Duration::from_secs(2)).await?;
	assert_eq!(added.kind(), pb::ClientEventKind::Add);
	assert_eq!(added.pseudonyms, vec!["bob".to_string()]);

	let reply = bob
		.unary(pb::request::Body::Disconnect(pb::DisconnectRequest {
			pseudonym: "bob".to_string(),
		}))
		.await?;
	assert_eq!(reply.status(), pb::StatusCode::Ok);

	let removed = events.expect_client_event(Duration::from_secs(2)).await?;
	assert_eq!(removed.kind(), pb::ClientEventKind::Remove);
	assert_eq!(removed.pseudonyms, vec!["bob".to_string()]);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn private_messages_reach_only_their_recipient() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let alice = TestClient::connect_transport(&server).await?;
	let bob = TestClient::connect_transport(&server).await?;
	let carol = TestClient::connect_transport(&server).await?;

	assert!(alice.connect_chat("A").await?.accepted);
	assert!(bob.connect_chat("B").await?.accepted);
	assert!(carol.connect_chat("C").await?.accepted);

	let mut sub_b = bob
		.subscribe(pb::request::Body::SubscribePrivateMessages(Default::default()))
		.await?;
	let mut sub_c = carol
		.subscribe(pb::request::Body::SubscribePrivateMessages(Default::default()))
		.await?;
	settle().await;

	assert_eq!(alice.send_message("secret", Some("B")).await?.status(), pb::StatusCode::Ok);

	let delivered = sub_b.expect_message(Duration::from_secs(2)).await?;
	assert_eq!(delivered.author, "A");
	assert_eq!(delivered.content, "secret");
	assert!(delivered.is_private);

	assert!(
		sub_c.next_frame(Duration::from_millis(500)).await?.is_none(),
		"bystander must not receive the private message"
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn private_message_to_unknown_recipient_is_not_found() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let alice = TestClient::connect_transport(&server).await?;
	assert!(alice.connect_chat("A").await?.accepted);

	let reply = alice.send_message("psst", Some("nobody")).await?;
	assert_eq!(reply.status(), pb::StatusCode::NotFound);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_rejects_rapid_sends_then_recovers() -> anyhow::Result<()> {
	let validation = ValidationChain::new()
		.with(ContentValidator::new(1, 300))
		.with(RateLimitValidator::new(Duration::from_secs(1)));
	let server = start_server(validation)?;

	let alice = TestClient::connect_transport(&server).await?;
	assert!(alice.connect_chat("A").await?.accepted);

	assert_eq!(alice.send_message("one", None).await?.status(), pb::StatusCode::Ok);

	let rejected = alice.send_message("two", None).await?;
	assert_eq!(rejected.status(), pb::StatusCode::ResourceExhausted);

	tokio::time::sleep(Duration::from_millis(1200)).await;
	assert_eq!(alice.send_message("three", None).await?.status(), pb::StatusCode::Ok);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_subscription_ends_with_cancelled_status() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let bob = TestClient::connect_transport(&server).await?;
	assert!(bob.connect_chat("B").await?.accepted);

	let mut sub = bob.subscribe(pb::request::Body::SubscribeMessages(Default::default())).await?;
	settle().await;

	sub.cancel();

	// one wait quantum (200 ms) plus scheduling slack
	let frame = timeout(Duration::from_millis(700), sub.next_frame(Duration::from_millis(700)))
		.await
		.context("terminal reply in time")??;

	match frame {
		Some(pb::ServerFrame {
			msg: Some(pb::server_frame::Msg::Reply(reply)),
		}) => assert_eq!(reply.status(), pb::StatusCode::Cancelled),
		other => panic!("expected terminal Reply, got: {other:?}"),
	}

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscription_without_registration_is_denied() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let stranger = TestClient::connect_transport(&server).await?;
	let mut sub = stranger
		.subscribe(pb::request::Body::SubscribeMessages(Default::default()))
		.await?;

	match sub.next_frame(Duration::from_secs(2)).await? {
		Some(pb::ServerFrame {
			msg: Some(pb::server_frame::Msg::Reply(reply)),
		}) => assert_eq!(reply.status(), pb::StatusCode::PermissionDenied),
		other => panic!("expected PermissionDenied reply, got: {other:?}"),
	}

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_response_carries_the_roster() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let alice = TestClient::connect_transport(&server).await?;
	let first = alice.connect_chat("alice").await?;
	assert!(first.accepted);
	assert!(first.connected_pseudonyms.is_empty());

	let bob = TestClient::connect_transport(&server).await?;
	let second = bob.connect_chat("bob").await?;
	assert!(second.accepted);
	assert_eq!(second.connected_pseudonyms, vec!["alice".to_string()]);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_message_without_registration_is_denied() -> anyhow::Result<()> {
	let server = start_server(permissive_validation())?;

	let stranger = TestClient::connect_transport(&server).await?;
	let reply = stranger.send_message("hello", None).await?;
	assert_eq!(reply.status(), pb::StatusCode::PermissionDenied);

	Ok(())
}
