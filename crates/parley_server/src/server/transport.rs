#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parley_protocol::{FramingError, Message, MessageCodec};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("transport closed")]
	Closed,

	#[error("write timed out after {0:?}")]
	TimedOut(Duration),

	#[error(transparent)]
	Framing(#[from] FramingError),
}

/// Inbound half of a client transport.
#[async_trait]
pub trait MessageReader: Send {
	/// Next message from the peer. `None` means the stream is over, whether the peer
	/// hung up or sent something unreadable.
	async fn read(&mut self) -> Option<Message>;
}

/// Outbound half of a client transport.
#[async_trait]
pub trait MessageWriter: Send {
	async fn send(&mut self, msg: &Message) -> Result<(), TransportError>;

	/// Flush and shut the outbound direction down. Errors are not interesting at this point.
	async fn close(&mut self);
}

/// Both halves of one client's transport.
pub struct Connection {
	pub reader: Box<dyn MessageReader>,
	pub writer: Box<dyn MessageWriter>,
}

impl Connection {
	pub fn new(reader: impl MessageReader + 'static, writer: impl MessageWriter + 'static) -> Self {
		Self {
			reader: Box::new(reader),
			writer: Box::new(writer),
		}
	}

	/// Length-prefixed framing over a TCP stream.
	pub fn tcp(stream: TcpStream, max_frame_size: usize) -> Self {
		let (read, write) = stream.into_split();
		let codec = MessageCodec::new(max_frame_size);
		Self::new(
			TcpReader {
				inner: FramedRead::new(read, codec),
			},
			TcpWriter {
				inner: FramedWrite::new(write, codec),
			},
		)
	}
}

pub struct TcpReader {
	inner: FramedRead<OwnedReadHalf, MessageCodec>,
}

#[async_trait]
impl MessageReader for TcpReader {
	async fn read(&mut self) -> Option<Message> {
		match self.inner.next().await {
			Some(Ok(msg)) => Some(msg),
			Some(Err(e)) => {
				debug!(error = %e, "tcp read failed");
				None
			}
			None => None,
		}
	}
}

pub struct TcpWriter {
	inner: FramedWrite<OwnedWriteHalf, MessageCodec>,
}

#[async_trait]
impl MessageWriter for TcpWriter {
	async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
		self.inner.send(msg.clone()).await?;
		Ok(())
	}

	async fn close(&mut self) {
		if let Err(e) = SinkExt::<Message>::close(&mut self.inner).await {
			debug!(error = %e, "tcp shutdown failed");
		}
	}
}

/// Bounds every send and close on the wrapped writer by `timeout`.
///
/// The first timeout marks the writer dead: later sends fail with [`TransportError::Closed`]
/// without touching the transport, and `close` skips the flush.
pub(crate) struct DeadlineWriter {
	inner: Box<dyn MessageWriter>,
	timeout: Duration,
	dead: bool,
}

impl DeadlineWriter {
	pub(crate) fn new(inner: Box<dyn MessageWriter>, timeout: Duration) -> Self {
		Self {
			inner,
			timeout,
			dead: false,
		}
	}

	pub(crate) fn is_dead(&self) -> bool {
		self.dead
	}
}

#[async_trait]
impl MessageWriter for DeadlineWriter {
	async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
		if self.dead {
			return Err(TransportError::Closed);
		}

		match tokio::time::timeout(self.timeout, self.inner.send(msg)).await {
			Ok(result) => result,
			Err(_) => {
				self.dead = true;
				Err(TransportError::TimedOut(self.timeout))
			}
		}
	}

	async fn close(&mut self) {
		if self.dead {
			debug!("writer stalled, skipping flush on close");
			return;
		}

		if tokio::time::timeout(self.timeout, self.inner.close()).await.is_err() {
			self.dead = true;
			debug!(timeout = ?self.timeout, "writer close timed out");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::Ordering;
	use std::time::Instant;

	use parley_protocol::Command;

	use super::*;
	use crate::server::mock::{StalledWriter, detached_writer};

	#[tokio::test]
	async fn timed_out_writer_fails_fast_afterwards() {
		let (stalled, attempts) = StalledWriter::new();
		let mut writer = DeadlineWriter::new(Box::new(stalled), Duration::from_millis(30));
		let msg = Message::new(Command::IM, "x");

		assert!(matches!(writer.send(&msg).await, Err(TransportError::TimedOut(_))));
		assert!(writer.is_dead());

		let started = Instant::now();
		assert!(matches!(writer.send(&msg).await, Err(TransportError::Closed)));
		writer.close().await;
		assert!(started.elapsed() < Duration::from_millis(30));
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn healthy_writer_passes_through() {
		let (inner, sent) = detached_writer();
		let mut writer = DeadlineWriter::new(Box::new(inner), Duration::from_millis(30));

		writer.send(&Message::new(Command::PING, "")).await.expect("send");
		writer.close().await;
		assert!(!writer.is_dead());
		assert_eq!(sent.lock().len(), 1);
	}
}
