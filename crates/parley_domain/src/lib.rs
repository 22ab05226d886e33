#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown client event kind: {0}")]
	UnknownEventKind(String),
}

/// Transport-assigned opaque identifier for a live client connection.
///
/// One `PeerId` per connection; every RPC carried on that connection
/// presents the same value. The registry keys its membership map on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
	/// Create a non-empty `PeerId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Identity string for a live socket connection, in the
	/// `ipv4:<addr>:<port>` / `ipv6:[<addr>]:<port>` form.
	pub fn from_remote_addr(addr: std::net::SocketAddr) -> Self {
		match addr {
			std::net::SocketAddr::V4(v4) => Self(format!("ipv4:{}:{}", v4.ip(), v4.port())),
			std::net::SocketAddr::V6(v6) => Self(format!("ipv6:[{}]:{}", v6.ip(), v6.port())),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for PeerId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		PeerId::new(s.to_string())
	}
}

/// User-chosen display name, unique across live peers at any instant.
///
/// Comparison is exact (byte-for-byte); the core treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pseudonym(String);

impl Pseudonym {
	/// Create a non-empty `Pseudonym`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Pseudonym {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Pseudonym {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Pseudonym::new(s.to_string())
	}
}

/// A chat message as stored by the broadcasters and written to streams.
///
/// Broadcast records live in the append-only room history; private records
/// live in exactly one recipient queue and are dropped after delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
	pub author: Pseudonym,
	pub content: String,
	pub private: bool,
}

impl MessageRecord {
	/// A public room message.
	pub fn broadcast(author: Pseudonym, content: impl Into<String>) -> Self {
		Self {
			author,
			content: content.into(),
			private: false,
		}
	}

	/// A directed message for a single recipient.
	pub fn direct(author: Pseudonym, content: impl Into<String>) -> Self {
		Self {
			author,
			content: content.into(),
			private: true,
		}
	}
}

/// Kind of a membership delta (or roster snapshot) sent to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEventKind {
	Add,
	Remove,
	Sync,
}

impl ClientEventKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			ClientEventKind::Add => "add",
			ClientEventKind::Remove => "remove",
			ClientEventKind::Sync => "sync",
		}
	}
}

impl fmt::Display for ClientEventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ClientEventKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"add" => Ok(ClientEventKind::Add),
			"remove" => Ok(ClientEventKind::Remove),
			"sync" => Ok(ClientEventKind::Sync),
			other => Err(ParseIdError::UnknownEventKind(other.to_string())),
		}
	}
}

/// One entry of the client-event log.
///
/// `pseudonyms` is a singleton for `Add`/`Remove`; only the synthetic
/// `Sync` frame emitted at subscription start carries the whole roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEventRecord {
	pub kind: ClientEventKind,
	pub pseudonyms: Vec<Pseudonym>,
}

impl ClientEventRecord {
	/// A single-name membership delta.
	pub fn delta(kind: ClientEventKind, pseudonym: Pseudonym) -> Self {
		Self {
			kind,
			pseudonyms: vec![pseudonym],
		}
	}

	/// A roster snapshot frame.
	pub fn sync(roster: Vec<Pseudonym>) -> Self {
		Self {
			kind: ClientEventKind::Sync,
			pseudonyms: roster,
		}
	}
}
