#![forbid(unsafe_code)]

use std::fmt;

/// Message command kind.
///
/// Kept as an open newtype: unknown commands travel through the server untouched,
/// only the named ones carry meaning here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Command(pub u8);

impl Command {
	pub const AUTH_STATUS: Self = Self(3);
	/// Peer-to-peer instant message.
	pub const IM: Self = Self(4);
	pub const ACK: Self = Self(5);
	pub const GROUP_NOTIFICATION: Self = Self(7);
	/// Group instant message.
	pub const GROUP_IM: Self = Self(8);
	pub const PING: Self = Self(13);
	pub const PONG: Self = Self(14);
	pub const AUTH_TOKEN: Self = Self(15);
	/// Real-time (transient, not stored) direct message.
	pub const RT: Self = Self(17);
	pub const ENTER_ROOM: Self = Self(18);
	pub const LEAVE_ROOM: Self = Self(19);
	/// Chat-room instant message.
	pub const ROOM_IM: Self = Self(20);
	pub const SYSTEM: Self = Self(21);
	/// Synthetic side-channel message sent right before the message it describes.
	pub const METADATA: Self = Self(32);

	/// Whether delivering this command counts as an outbound real-time message.
	#[inline]
	pub fn is_realtime(self) -> bool {
		matches!(self, Self::RT | Self::IM | Self::GROUP_IM | Self::ROOM_IM)
	}

	pub fn name(self) -> Option<&'static str> {
		let name = match self {
			Self::AUTH_STATUS => "AUTH_STATUS",
			Self::IM => "IM",
			Self::ACK => "ACK",
			Self::GROUP_NOTIFICATION => "GROUP_NOTIFICATION",
			Self::GROUP_IM => "GROUP_IM",
			Self::PING => "PING",
			Self::PONG => "PONG",
			Self::AUTH_TOKEN => "AUTH_TOKEN",
			Self::RT => "RT",
			Self::ENTER_ROOM => "ENTER_ROOM",
			Self::LEAVE_ROOM => "LEAVE_ROOM",
			Self::ROOM_IM => "ROOM_IM",
			Self::SYSTEM => "SYSTEM",
			Self::METADATA => "METADATA",
			_ => return None,
		};
		Some(name)
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.name() {
			Some(name) => f.write_str(name),
			None => write!(f, "CMD({})", self.0),
		}
	}
}

impl From<u8> for Command {
	fn from(v: u8) -> Self {
		Self(v)
	}
}
