#![forbid(unsafe_code)]

//! Wire messages for `parley.v1`.
//!
//! Written by hand with the prost derive macros rather than generated from
//! a `.proto`, so the crate builds without `protoc`. Field tags are part of
//! the wire contract; never renumber an existing tag.

/// Status vocabulary shared by every reply, modeled on the usual RPC codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
	Ok = 0,
	InvalidArgument = 1,
	Unauthenticated = 2,
	PermissionDenied = 3,
	NotFound = 4,
	ResourceExhausted = 5,
	Cancelled = 6,
	Unknown = 7,
}

/// Kind of a client event frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClientEventKind {
	Add = 0,
	Remove = 1,
	Sync = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
	#[prost(string, tag = "1")]
	pub pseudonym: String,
	#[prost(string, tag = "2")]
	pub gender: String,
	#[prost(string, tag = "3")]
	pub country: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
	/// Business-level acceptance; a rejection is still a successful call.
	#[prost(bool, tag = "1")]
	pub accepted: bool,
	#[prost(string, tag = "2")]
	pub message: String,
	/// Roster snapshot taken at accept time.
	#[prost(string, repeated, tag = "3")]
	pub connected_pseudonyms: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectRequest {
	#[prost(string, tag = "1")]
	pub pseudonym: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessageRequest {
	#[prost(string, tag = "1")]
	pub content: String,
	/// Absent for room broadcasts; set to address a single recipient.
	#[prost(string, optional, tag = "2")]
	pub private_recipient: Option<String>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SubscribeMessagesRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SubscribeClientEventsRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SubscribePrivateMessagesRequest {}

/// One chat message delivered on a subscription stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub author: String,
	#[prost(string, tag = "2")]
	pub content: String,
	#[prost(bool, tag = "3")]
	pub is_private: bool,
}

/// One membership event delivered on a client-event stream.
///
/// `pseudonyms` holds exactly one name for `ADD`/`REMOVE` and the full
/// roster for the synthetic `SYNC` frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientEvent {
	#[prost(int32, tag = "1")]
	pub kind: i32,
	#[prost(string, repeated, tag = "2")]
	pub pseudonyms: Vec<String>,
}

impl ClientEvent {
	pub fn kind(&self) -> ClientEventKind {
		ClientEventKind::try_from(self.kind).unwrap_or(ClientEventKind::Add)
	}
}

/// Unary response, also the terminal frame of every subscription stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reply {
	#[prost(int32, tag = "1")]
	pub status: i32,
	#[prost(string, tag = "2")]
	pub detail: String,
	#[prost(message, optional, tag = "3")]
	pub connect: Option<ConnectResponse>,
}

impl Reply {
	pub fn status(&self) -> StatusCode {
		StatusCode::try_from(self.status).unwrap_or(StatusCode::Unknown)
	}

	/// A bare `OK` reply.
	pub fn ok() -> Self {
		Self {
			status: StatusCode::Ok as i32,
			detail: String::new(),
			connect: None,
		}
	}

	pub fn with_status(status: StatusCode, detail: impl Into<String>) -> Self {
		Self {
			status: status as i32,
			detail: detail.into(),
			connect: None,
		}
	}
}

/// The single frame a client writes to open an RPC.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
	#[prost(oneof = "request::Body", tags = "1, 2, 3, 4, 5, 6")]
	pub body: Option<request::Body>,
}

pub mod request {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Body {
		#[prost(message, tag = "1")]
		Connect(super::ConnectRequest),
		#[prost(message, tag = "2")]
		Disconnect(super::DisconnectRequest),
		#[prost(message, tag = "3")]
		SendMessage(super::SendMessageRequest),
		#[prost(message, tag = "4")]
		SubscribeMessages(super::SubscribeMessagesRequest),
		#[prost(message, tag = "5")]
		SubscribeClientEvents(super::SubscribeClientEventsRequest),
		#[prost(message, tag = "6")]
		SubscribePrivateMessages(super::SubscribePrivateMessagesRequest),
	}
}

/// Every frame the server writes back on an RPC stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerFrame {
	#[prost(oneof = "server_frame::Msg", tags = "1, 2, 3")]
	pub msg: Option<server_frame::Msg>,
}

pub mod server_frame {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "1")]
		Reply(super::Reply),
		#[prost(message, tag = "2")]
		Message(super::ChatMessage),
		#[prost(message, tag = "3")]
		ClientEvent(super::ClientEvent),
	}
}

impl ServerFrame {
	pub fn reply(reply: Reply) -> Self {
		Self {
			msg: Some(server_frame::Msg::Reply(reply)),
		}
	}

	pub fn message(message: ChatMessage) -> Self {
		Self {
			msg: Some(server_frame::Msg::Message(message)),
		}
	}

	pub fn client_event(event: ClientEvent) -> Self {
		Self {
			msg: Some(server_frame::Msg::ClientEvent(event)),
		}
	}
}
