#![forbid(unsafe_code)]

pub mod command;
pub mod framing;
pub mod message;

pub use command::Command;
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, MessageCodec};
pub use message::Message;

/// Protocol version constants.
pub mod version {
	/// Version stamped on messages built by the server when nothing was negotiated.
	pub const DEFAULT_PROTOCOL_VERSION: u8 = 1;

	/// Highest version this server understands.
	pub const MAX_PROTOCOL_VERSION: u8 = 2;
}
