#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_domain::PeerId;
use parley_protocol::{encode_frame, pb, try_decode_frame_from_buffer};
use tracing::{debug, info, warn};

use crate::server::service::ChatService;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: parley_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Writes length-prefixed [`pb::ServerFrame`]s onto one RPC stream.
pub struct FrameWriter {
	send: quinn::SendStream,
	max_frame_bytes: usize,
}

impl FrameWriter {
	pub fn new(send: quinn::SendStream, max_frame_bytes: usize) -> Self {
		Self { send, max_frame_bytes }
	}

	pub async fn write(&mut self, frame: &pb::ServerFrame) -> anyhow::Result<()> {
		let bytes = encode_frame(frame, self.max_frame_bytes)?;

		metrics::counter!("parley_server_frames_out_total").increment(1);
		metrics::counter!("parley_server_bytes_out_total").increment(bytes.len() as u64);

		self.send.write_all(&bytes).await.context("stream write")?;
		Ok(())
	}

	/// Signal end of stream; the peer may already be gone.
	pub fn finish(mut self) {
		let _ = self.send.finish();
	}
}

/// Accept QUIC connections forever, one handler task per connection.
pub async fn serve(endpoint: quinn::Endpoint, service: Arc<ChatService>, settings: ConnectionSettings) {
	let mut next_conn_id: u64 = 1;

	while let Some(incoming) = endpoint.accept().await {
		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);

		let service = Arc::clone(&service);
		let settings = settings.clone();

		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					if let Err(e) = handle_connection(conn_id, connection, service, settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}
}

/// Handle one QUIC connection: every client-opened bidirectional stream
/// carries exactly one RPC. All streams share the connection's peer
/// identity, so the registry sees one peer regardless of how many RPCs the
/// client runs in parallel.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	service: Arc<ChatService>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let peer = PeerId::from_remote_addr(connection.remote_address());
	info!(conn_id, peer = %peer, "accepted connection");

	loop {
		let (send, recv) = match connection.accept_bi().await {
			Ok(streams) => streams,
			Err(e) => {
				debug!(conn_id, peer = %peer, reason = %e, "connection closed");
				return Ok(());
			}
		};

		metrics::counter!("parley_server_rpcs_total").increment(1);

		let service = Arc::clone(&service);
		let peer = peer.clone();
		let settings = settings.clone();

		tokio::spawn(async move {
			if let Err(e) = handle_rpc(conn_id, peer, service, send, recv, settings).await {
				debug!(conn_id, error = %e, "rpc handler ended with error");
			}
		});
	}
}

async fn handle_rpc(
	conn_id: u64,
	peer: PeerId,
	service: Arc<ChatService>,
	send: quinn::SendStream,
	mut recv: quinn::RecvStream,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let request = read_request(&mut recv, settings.max_frame_bytes).await?;
	let mut writer = FrameWriter::new(send, settings.max_frame_bytes);

	let Some(body) = request.body else {
		writer
			.write(&pb::ServerFrame::reply(pb::Reply::with_status(
				pb::StatusCode::InvalidArgument,
				"missing request body",
			)))
			.await?;
		writer.finish();
		return Ok(());
	};

	match body {
		pb::request::Body::Connect(req) => {
			let response = service.connect(&peer, req);
			writer
				.write(&pb::ServerFrame::reply(pb::Reply {
					status: pb::StatusCode::Ok as i32,
					detail: String::new(),
					connect: Some(response),
				}))
				.await?;
		}

		pb::request::Body::Disconnect(req) => {
			service.disconnect(&peer, req);
			writer.write(&pb::ServerFrame::reply(pb::Reply::ok())).await?;
		}

		pb::request::Body::SendMessage(req) => {
			let reply = match service.send_message(&peer, req) {
				Ok(()) => pb::Reply::ok(),
				Err(rejection) => pb::Reply::with_status(rejection.status_code(), rejection.to_string()),
			};
			writer.write(&pb::ServerFrame::reply(reply)).await?;
		}

		pb::request::Body::SubscribeMessages(_) => {
			debug!(conn_id, peer = %peer, "message subscription opened");
			let cancelled = spawn_cancellation_watcher(recv);
			let reply = service.subscribe_messages(&peer, &cancelled, &mut writer).await;
			debug!(conn_id, peer = %peer, status = reply.status, "message subscription closed");
			let _ = writer.write(&pb::ServerFrame::reply(reply)).await;
			writer.finish();
			return Ok(());
		}

		pb::request::Body::SubscribeClientEvents(_) => {
			debug!(conn_id, peer = %peer, "client-event subscription opened");
			let cancelled = spawn_cancellation_watcher(recv);
			let reply = service.subscribe_client_events(&peer, &cancelled, &mut writer).await;
			debug!(conn_id, peer = %peer, status = reply.status, "client-event subscription closed");
			let _ = writer.write(&pb::ServerFrame::reply(reply)).await;
			writer.finish();
			return Ok(());
		}

		pb::request::Body::SubscribePrivateMessages(_) => {
			debug!(conn_id, peer = %peer, "private-message subscription opened");
			let cancelled = spawn_cancellation_watcher(recv);
			let reply = service.subscribe_private_messages(&peer, &cancelled, &mut writer).await;
			debug!(conn_id, peer = %peer, status = reply.status, "private-message subscription closed");
			let _ = writer.write(&pb::ServerFrame::reply(reply)).await;
			writer.finish();
			return Ok(());
		}
	}

	writer.finish();
	Ok(())
}

/// Read exactly one request frame from the stream's receive half.
async fn read_request(recv: &mut quinn::RecvStream, max_frame_bytes: usize) -> anyhow::Result<pb::Request> {
	let mut buf = BytesMut::with_capacity(4 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		if let Some(request) = try_decode_frame_from_buffer::<pb::Request>(&mut buf, max_frame_bytes)
			.context("failed to decode request frame")?
		{
			return Ok(request);
		}

		match recv.read(&mut tmp).await.context("request stream read failed")? {
			Some(n) => buf.extend_from_slice(&tmp[..n]),
			None => return Err(anyhow!("stream closed before a full request frame")),
		}
	}
}

/// Watch the stream's receive half after the request has been consumed.
/// The client cancels by finishing or resetting its send side (or by
/// closing the connection); the flag is polled by the streaming loops once
/// per wait quantum.
fn spawn_cancellation_watcher(mut recv: quinn::RecvStream) -> Arc<AtomicBool> {
	let cancelled = Arc::new(AtomicBool::new(false));
	let flag = Arc::clone(&cancelled);

	tokio::spawn(async move {
		let mut scratch = [0u8; 64];
		loop {
			match recv.read(&mut scratch).await {
				// stray bytes after the request frame carry no meaning
				Ok(Some(_)) => continue,
				Ok(None) | Err(_) => {
					flag.store(true, Ordering::Relaxed);
					return;
				}
			}
		}
	});

	cancelled
}
