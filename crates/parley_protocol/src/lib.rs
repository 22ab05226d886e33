#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, try_decode_frame_from_buffer};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// ALPN identifier negotiated on every connection.
	pub const ALPN: &[u8] = b"parley-v1";
}
