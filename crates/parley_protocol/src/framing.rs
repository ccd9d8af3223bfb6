#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message as _;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::message::Message;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("field {field} out of range: {value}")]
	FieldOutOfRange {
		field: &'static str,
		value: u32,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// On-the-wire representation of a [`Message`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
	#[prost(uint32, tag = "1")]
	pub cmd: u32,
	#[prost(uint32, tag = "2")]
	pub seq: u32,
	#[prost(uint32, tag = "3")]
	pub version: u32,
	#[prost(uint32, tag = "4")]
	pub flag: u32,
	#[prost(bytes = "bytes", tag = "5")]
	pub body: Bytes,
	#[prost(bytes = "bytes", optional, tag = "6")]
	pub meta: Option<Bytes>,
}

impl From<&Message> for Frame {
	fn from(msg: &Message) -> Self {
		Self {
			cmd: u32::from(msg.cmd.0),
			seq: msg.seq,
			version: u32::from(msg.version),
			flag: u32::from(msg.flag),
			body: msg.body.clone(),
			meta: msg.meta.clone(),
		}
	}
}

impl TryFrom<Frame> for Message {
	type Error = FramingError;

	fn try_from(frame: Frame) -> Result<Self, Self::Error> {
		let narrow = |field: &'static str, value: u32| {
			u8::try_from(value).map_err(|_| FramingError::FieldOutOfRange { field, value })
		};

		Ok(Self {
			cmd: Command(narrow("cmd", frame.cmd)?),
			seq: frame.seq,
			version: narrow("version", frame.version)?,
			flag: narrow("flag", frame.flag)?,
			body: frame.body,
			meta: frame.meta,
		})
	}
}

/// Length-prefixed protobuf codec: a big-endian `u32` payload length followed by an encoded [`Frame`].
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
	max_frame_size: usize,
}

impl MessageCodec {
	pub fn new(max_frame_size: usize) -> Self {
		Self { max_frame_size }
	}

	pub fn max_frame_size(&self) -> usize {
		self.max_frame_size
	}
}

impl Default for MessageCodec {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_FRAME_SIZE)
	}
}

impl Decoder for MessageCodec {
	type Item = Message;
	type Error = FramingError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < LEN_PREFIX {
			return Ok(None);
		}

		let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
		if len > self.max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len,
				max: self.max_frame_size,
			});
		}

		let need = LEN_PREFIX + len;
		if src.len() < need {
			src.reserve(need - src.len());
			return Ok(None);
		}

		let mut frame = src.split_to(need).freeze();
		frame.advance(LEN_PREFIX);
		let wire = Frame::decode(frame)?;
		Message::try_from(wire).map(Some)
	}
}

impl Encoder<Message> for MessageCodec {
	type Error = FramingError;

	fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let wire = Frame::from(&item);
		let payload_len = wire.encoded_len();
		if payload_len > self.max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len: payload_len,
				max: self.max_frame_size,
			});
		}

		dst.reserve(LEN_PREFIX + payload_len);
		dst.put_u32(payload_len as u32);
		wire.encode(dst)?;
		Ok(())
	}
}
