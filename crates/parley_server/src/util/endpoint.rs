#![forbid(unsafe_code)]

use std::net::SocketAddr;

/// Parsed `host:port` listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenEndpoint {
	pub host: String,
	pub port: u16,
}

impl ListenEndpoint {
	/// Returns `host:port` (IPv6 stays bracketed).
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Convert to `SocketAddr`; the host must be an IP literal.
	pub fn to_socket_addr(&self) -> Result<SocketAddr, String> {
		self.hostport()
			.parse()
			.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
	}

	/// Parse a listen endpoint in the form `host:port`.
	pub fn parse(s: &str) -> Result<Self, String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("endpoint must be non-empty (expected host:port)".to_string());
		}

		let (host, port_str) = s
			.rsplit_once(':')
			.ok_or_else(|| format!("invalid endpoint (missing :port, expected host:port): {s}"))?;

		let host = host.trim();
		if host.is_empty() {
			return Err(format!("invalid endpoint host (expected host:port): {s}"));
		}

		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(format!("invalid endpoint host (IPv6 must be bracketed like [::1]:50051): {s}"));
		}

		let port: u16 = port_str
			.trim()
			.parse()
			.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

		if port == 0 {
			return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
		}

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}
}
