#![forbid(unsafe_code)]

use bytes::Bytes;

use crate::command::Command;
use crate::version::DEFAULT_PROTOCOL_VERSION;

/// A protocol message as seen by the server core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub cmd: Command,
	pub seq: u32,
	pub version: u8,
	pub flag: u8,
	pub body: Bytes,
	/// Side-channel metadata, delivered as a separate `METADATA` message ahead of this one.
	pub meta: Option<Bytes>,
}

impl Message {
	pub fn new(cmd: Command, body: impl Into<Bytes>) -> Self {
		Self {
			cmd,
			seq: 0,
			version: DEFAULT_PROTOCOL_VERSION,
			flag: 0,
			body: body.into(),
			meta: None,
		}
	}

	/// Builds the synthetic metadata message that precedes a message carrying `meta`.
	pub fn metadata(version: u8, meta: Bytes) -> Self {
		Self {
			version,
			..Self::new(Command::METADATA, meta)
		}
	}

	pub fn with_seq(mut self, seq: u32) -> Self {
		self.seq = seq;
		self
	}

	pub fn with_version(mut self, version: u8) -> Self {
		self.version = version;
		self
	}

	pub fn with_meta(mut self, meta: impl Into<Bytes>) -> Self {
		self.meta = Some(meta.into());
		self
	}
}
