#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_protocol::Message;
use tokio::sync::mpsc;

use crate::server::client::Client;
use crate::server::observer::ClientObserver;
use crate::server::transport::{Connection, MessageReader, MessageWriter, TransportError};

/// Test side of an in-memory transport.
#[derive(Clone)]
pub(crate) struct MockPeer {
	inbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
	pub sent: Arc<Mutex<Vec<Message>>>,
	pub reads: Arc<AtomicUsize>,
	pub closed: Arc<AtomicBool>,
}

impl MockPeer {
	/// Delivers `msg` to the client's read loop.
	pub fn push(&self, msg: Message) {
		if let Some(tx) = self.inbound.lock().as_ref() {
			let _ = tx.send(msg);
		}
	}

	/// Simulates the peer hanging up.
	pub fn hang_up(&self) {
		self.inbound.lock().take();
	}

	pub fn sent(&self) -> Vec<Message> {
		self.sent.lock().clone()
	}

	pub async fn wait_for_sent(&self, n: usize) -> Vec<Message> {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
		loop {
			let sent = self.sent();
			if sent.len() >= n || tokio::time::Instant::now() >= deadline {
				return sent;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	}
}

struct MockReader {
	rx: mpsc::UnboundedReceiver<Message>,
	reads: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageReader for MockReader {
	async fn read(&mut self) -> Option<Message> {
		self.reads.fetch_add(1, Ordering::SeqCst);
		self.rx.recv().await
	}
}

pub(crate) struct MockWriter {
	sent: Arc<Mutex<Vec<Message>>>,
	closed: Arc<AtomicBool>,
}

#[async_trait]
impl MessageWriter for MockWriter {
	async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(TransportError::Closed);
		}
		self.sent.lock().push(msg.clone());
		Ok(())
	}

	async fn close(&mut self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}

/// Writer for a peer that stopped reading: sends and closes never complete.
pub(crate) struct StalledWriter {
	attempts: Arc<AtomicUsize>,
}

impl StalledWriter {
	pub(crate) fn new() -> (Self, Arc<AtomicUsize>) {
		let attempts: Arc<AtomicUsize> = Arc::default();
		(
			Self {
				attempts: Arc::clone(&attempts),
			},
			attempts,
		)
	}
}

#[async_trait]
impl MessageWriter for StalledWriter {
	async fn send(&mut self, _msg: &Message) -> Result<(), TransportError> {
		self.attempts.fetch_add(1, Ordering::SeqCst);
		std::future::pending().await
	}

	async fn close(&mut self) {
		std::future::pending::<()>().await
	}
}

fn mock_peer() -> (MockPeer, MockReader) {
	let (tx, rx) = mpsc::unbounded_channel();
	let peer = MockPeer {
		inbound: Arc::new(Mutex::new(Some(tx))),
		sent: Arc::default(),
		reads: Arc::default(),
		closed: Arc::default(),
	};
	let reader = MockReader {
		rx,
		reads: Arc::clone(&peer.reads),
	};
	(peer, reader)
}

pub(crate) fn mock_connection() -> (Connection, MockPeer) {
	let (peer, reader) = mock_peer();
	let writer = MockWriter {
		sent: Arc::clone(&peer.sent),
		closed: Arc::clone(&peer.closed),
	};
	(Connection::new(reader, writer), peer)
}

/// A connection whose outbound side never drains. The returned counter tracks send attempts
/// that reached the transport.
pub(crate) fn stalled_connection() -> (Connection, MockPeer, Arc<AtomicUsize>) {
	let (peer, reader) = mock_peer();
	let (writer, attempts) = StalledWriter::new();
	(Connection::new(reader, writer), peer, attempts)
}

/// A writer that is not attached to any client, for driving flushes by hand.
pub(crate) fn detached_writer() -> (MockWriter, Arc<Mutex<Vec<Message>>>) {
	let sent: Arc<Mutex<Vec<Message>>> = Arc::default();
	let writer = MockWriter {
		sent: Arc::clone(&sent),
		closed: Arc::default(),
	};
	(writer, sent)
}

/// Observer that records what it sees.
#[derive(Default)]
pub(crate) struct RecordingObserver {
	pub messages: Mutex<Vec<Message>>,
	pub closes: AtomicUsize,
	/// Set on the client from inside `on_client_message`, when present.
	pub throttle_on_message: AtomicBool,
}

impl RecordingObserver {
	pub fn closes(&self) -> usize {
		self.closes.load(Ordering::SeqCst)
	}

	pub async fn wait_for_close(&self) -> bool {
		let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
		while tokio::time::Instant::now() < deadline {
			if self.closes() > 0 {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		false
	}
}

#[async_trait]
impl ClientObserver for RecordingObserver {
	async fn on_client_message(&self, client: &Arc<Client>, msg: Message) {
		self.messages.lock().push(msg);
		if self.throttle_on_message.load(Ordering::SeqCst) {
			client.throttle();
		}
	}

	async fn on_client_close(&self, _client: &Arc<Client>) {
		self.closes.fetch_add(1, Ordering::SeqCst);
	}
}
