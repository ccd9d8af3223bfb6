#![forbid(unsafe_code)]

//! One client connection: a read task feeding the session observer and a write task
//! draining three outbound queues onto the transport.
//!
//! ```text
//!  transport ──► read loop ──► ClientObserver::on_client_message
//!                    │
//!                    └─(eof / throttled)─► close sequence ──► Outbound::Shutdown
//!
//!  send_message ─────► direct (300) ─┐
//!  send_messages ────► batch (10)  ──┼─► write loop (select!) ──► transport
//!  enqueue_message ──► pending + wake (1) ┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parley_protocol::Message;
use parley_protocol::version::DEFAULT_PROTOCOL_VERSION;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::observer::ClientObserver;
use crate::server::summary::ServerSummary;
use crate::server::transport::{Connection, DeadlineWriter, MessageReader, MessageWriter, TransportError};

/// Capacity of the single-message queue.
pub const DIRECT_CHANNEL_CAPACITY: usize = 300;
/// Capacity of the batch queue. Users in many large rooms can still fill it.
pub const BATCH_CHANNEL_CAPACITY: usize = 10;
/// One outstanding wake is enough: a flush takes everything queued so far.
const WAKE_CHANNEL_CAPACITY: usize = 1;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Tuning knobs for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub direct_capacity: usize,
	pub batch_capacity: usize,
	/// How long the write loop keeps swallowing direct sends after shutdown.
	pub shutdown_grace: Duration,
	/// Longest a single transport send or close may take. A peer that stops reading hits
	/// this once, after which the writer is treated as dead.
	pub write_timeout: Duration,
	/// Reads slower than this are logged.
	pub slow_read_threshold: Duration,
	/// Observer calls slower than this are logged.
	pub slow_handler_threshold: Duration,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			direct_capacity: DIRECT_CHANNEL_CAPACITY,
			batch_capacity: BATCH_CHANNEL_CAPACITY,
			shutdown_grace: Duration::from_millis(200),
			write_timeout: Duration::from_secs(10),
			slow_read_threshold: Duration::from_secs(6 * 60),
			slow_handler_threshold: Duration::from_secs(2),
		}
	}
}

/// Items on the direct queue.
#[derive(Debug)]
pub(crate) enum Outbound {
	Message(Message),
	/// Ends the write loop's main phase. Only the close sequence sends this.
	Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
	#[error("client outbound queue is full")]
	Full,

	#[error("client write loop has exited")]
	Closed,
}

impl<T> From<mpsc::error::TrySendError<T>> for EnqueueError {
	fn from(e: mpsc::error::TrySendError<T>) -> Self {
		match e {
			mpsc::error::TrySendError::Full(_) => Self::Full,
			mpsc::error::TrySendError::Closed(_) => Self::Closed,
		}
	}
}

/// Messages waiting for the next flush.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
	messages: Mutex<Vec<Message>>,
}

impl PendingQueue {
	pub(crate) fn push(&self, msg: Message) {
		self.messages.lock().push(msg);
	}

	/// Returns how many messages were appended.
	pub(crate) fn extend(&self, msgs: impl IntoIterator<Item = Message>) -> usize {
		let mut queue = self.messages.lock();
		let before = queue.len();
		queue.extend(msgs);
		queue.len() - before
	}

	/// Swaps the queue for an empty one. `None` when nothing is pending.
	pub(crate) fn take(&self) -> Option<Vec<Message>> {
		let mut queue = self.messages.lock();
		if queue.is_empty() {
			return None;
		}
		Some(std::mem::take(&mut *queue))
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.messages.lock().len()
	}
}

/// Everything owned by the two loops, handed over on `run`.
struct Loops {
	connection: Connection,
	direct_rx: mpsc::Receiver<Outbound>,
	batch_rx: mpsc::Receiver<Vec<Message>>,
	wake_rx: mpsc::Receiver<()>,
}

pub struct Client {
	id: u64,
	uid: AtomicI64,
	version: AtomicU8,
	throttled: AtomicBool,
	closing: AtomicBool,
	closed: AtomicBool,

	pending: PendingQueue,
	direct_tx: mpsc::Sender<Outbound>,
	batch_tx: mpsc::Sender<Vec<Message>>,
	wake_tx: mpsc::Sender<()>,
	loops: Mutex<Option<Loops>>,

	summary: Arc<ServerSummary>,
	observer: Arc<dyn ClientObserver>,
	config: ClientConfig,
}

impl fmt::Debug for Client {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Client")
			.field("id", &self.id)
			.field("uid", &self.uid())
			.field("throttled", &self.is_throttled())
			.field("closed", &self.is_closed())
			.finish_non_exhaustive()
	}
}

impl Client {
	pub fn new(connection: Connection, summary: Arc<ServerSummary>, observer: Arc<dyn ClientObserver>) -> Arc<Self> {
		Self::with_config(connection, summary, observer, ClientConfig::default())
	}

	pub fn with_config(
		connection: Connection,
		summary: Arc<ServerSummary>,
		observer: Arc<dyn ClientObserver>,
		config: ClientConfig,
	) -> Arc<Self> {
		let (direct_tx, direct_rx) = mpsc::channel(config.direct_capacity.max(1));
		let (batch_tx, batch_rx) = mpsc::channel(config.batch_capacity.max(1));
		let (wake_tx, wake_rx) = mpsc::channel(WAKE_CHANNEL_CAPACITY);

		Arc::new(Self {
			id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
			uid: AtomicI64::new(0),
			version: AtomicU8::new(DEFAULT_PROTOCOL_VERSION),
			throttled: AtomicBool::new(false),
			closing: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			pending: PendingQueue::default(),
			direct_tx,
			batch_tx,
			wake_tx,
			loops: Mutex::new(Some(Loops {
				connection,
				direct_rx,
				batch_rx,
				wake_rx,
			})),
			summary,
			observer,
			config,
		})
	}

	/// Process-unique connection id.
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Authenticated user id, `0` while anonymous.
	pub fn uid(&self) -> i64 {
		self.uid.load(Ordering::Acquire)
	}

	pub fn set_uid(&self, uid: i64) {
		self.uid.store(uid, Ordering::Release);
	}

	/// Negotiated protocol version, stamped on synthesized metadata messages.
	pub fn version(&self) -> u8 {
		self.version.load(Ordering::Relaxed)
	}

	pub fn set_version(&self, version: u8) {
		self.version.store(version, Ordering::Relaxed);
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Marks the write side as backlogged. The read loop closes the connection before
	/// its next read.
	pub fn throttle(&self) {
		self.throttled.store(true, Ordering::Release);
	}

	pub fn clear_throttle(&self) {
		self.throttled.store(false, Ordering::Release);
	}

	pub fn is_throttled(&self) -> bool {
		self.throttled.load(Ordering::Acquire)
	}

	/// Queues one message, waiting for room in the direct queue.
	pub async fn send_message(&self, msg: Message) -> Result<(), EnqueueError> {
		self.direct_tx
			.send(Outbound::Message(msg))
			.await
			.map_err(|_| EnqueueError::Closed)
	}

	pub fn try_send_message(&self, msg: Message) -> Result<(), EnqueueError> {
		self.direct_tx.try_send(Outbound::Message(msg))?;
		Ok(())
	}

	/// Queues a batch that is written back to back, waiting for room in the batch queue.
	pub async fn send_messages(&self, batch: Vec<Message>) -> Result<(), EnqueueError> {
		self.batch_tx.send(batch).await.map_err(|_| EnqueueError::Closed)
	}

	pub fn try_send_messages(&self, batch: Vec<Message>) -> Result<(), EnqueueError> {
		self.batch_tx.try_send(batch)?;
		Ok(())
	}

	/// Appends to the pending queue and asks the write loop for a flush. Never blocks on I/O.
	///
	/// Once the client is closed nothing flushes the queue any more, so the message is
	/// dropped and `Closed` is returned.
	pub fn enqueue_message(&self, msg: Message) -> Result<(), EnqueueError> {
		if self.is_closed() {
			self.drop_late(&msg);
			return Err(EnqueueError::Closed);
		}
		self.pending.push(msg);
		self.wake();
		Ok(())
	}

	pub fn enqueue_messages(&self, msgs: impl IntoIterator<Item = Message>) -> Result<(), EnqueueError> {
		if self.is_closed() {
			for msg in msgs {
				self.drop_late(&msg);
			}
			return Err(EnqueueError::Closed);
		}
		if self.pending.extend(msgs) > 0 {
			self.wake();
		}
		Ok(())
	}

	fn wake(&self) {
		// Full means a flush is already requested and will see this message too.
		let _ = self.wake_tx.try_send(());
	}

	/// Starts the write and read loops and returns right away.
	pub fn run(self: &Arc<Self>) {
		let _ = self.spawn_loops();
	}

	/// Returns `(read, write)` task handles, or `None` if the loops were already started.
	pub(crate) fn spawn_loops(self: &Arc<Self>) -> Option<(JoinHandle<()>, JoinHandle<()>)> {
		let Some(loops) = self.loops.lock().take() else {
			warn!(conn_id = self.id, "client loops already started");
			return None;
		};
		let Loops {
			connection,
			direct_rx,
			batch_rx,
			wake_rx,
		} = loops;

		let write = tokio::spawn(Arc::clone(self).write_loop(connection.writer, direct_rx, batch_rx, wake_rx));
		let read = tokio::spawn(Arc::clone(self).read_loop(connection.reader));
		Some((read, write))
	}

	async fn read_loop(self: Arc<Self>, mut reader: Box<dyn MessageReader>) {
		self.summary.connection_opened();

		loop {
			if self.is_throttled() {
				info!(conn_id = self.id, uid = self.uid(), "write side blocked, quitting read loop");
				metrics::counter!("parley_server_throttled_total").increment(1);
				self.close_sequence().await;
				break;
			}

			let read_started = Instant::now();
			let msg = reader.read().await;
			let read_elapsed = read_started.elapsed();
			if read_elapsed > self.config.slow_read_threshold {
				info!(
					conn_id = self.id,
					uid = self.uid(),
					elapsed_secs = read_elapsed.as_secs(),
					"socket read took too long"
				);
			}

			let Some(msg) = msg else {
				self.close_sequence().await;
				break;
			};

			let handle_started = Instant::now();
			let cmd = msg.cmd;
			self.observer.on_client_message(&self, msg).await;
			let handle_elapsed = handle_started.elapsed();
			if handle_elapsed > self.config.slow_handler_threshold {
				info!(
					conn_id = self.id,
					uid = self.uid(),
					%cmd,
					elapsed = ?handle_elapsed,
					"handling message is too slow"
				);
			}
		}
	}

	/// Runs at most once, whatever triggers it.
	async fn close_sequence(self: &Arc<Self>) {
		if self.closing.swap(true, Ordering::AcqRel) {
			return;
		}

		self.summary.connection_closed();
		if self.uid() > 0 {
			self.summary.client_closed();
		}
		self.closed.store(true, Ordering::Release);

		if self.direct_tx.send(Outbound::Shutdown).await.is_err() {
			debug!(conn_id = self.id, "write loop already gone");
		}

		self.observer.on_client_close(self).await;
	}

	async fn write_loop(
		self: Arc<Self>,
		writer: Box<dyn MessageWriter>,
		mut direct_rx: mpsc::Receiver<Outbound>,
		mut batch_rx: mpsc::Receiver<Vec<Message>>,
		mut wake_rx: mpsc::Receiver<()>,
	) {
		let mut writer = DeadlineWriter::new(writer, self.config.write_timeout);

		loop {
			tokio::select! {
				Some(out) = direct_rx.recv() => match out {
					Outbound::Message(msg) => self.deliver(&mut writer, &msg).await,
					Outbound::Shutdown => {
						writer.close().await;
						info!(conn_id = self.id, uid = self.uid(), "socket closed");
						break;
					}
				},
				Some(batch) = batch_rx.recv() => {
					for msg in &batch {
						self.deliver(&mut writer, msg).await;
					}
				}
				Some(()) = wake_rx.recv() => {
					self.flush_pending(&mut writer).await;
				}
				else => {
					writer.close().await;
					break;
				}
			}
		}

		if writer.is_dead() {
			info!(conn_id = self.id, uid = self.uid(), "peer stopped reading, socket dropped without flush");
		}
		// The transport is released before the grace window starts.
		drop(writer);

		self.drain_after_shutdown(&mut direct_rx).await;
		debug!(conn_id = self.id, "write loop exited");
	}

	/// Keeps direct senders from blocking on a dead writer for the grace window, then returns.
	async fn drain_after_shutdown(&self, direct_rx: &mut mpsc::Receiver<Outbound>) {
		let deadline = tokio::time::sleep(self.config.shutdown_grace);
		tokio::pin!(deadline);

		loop {
			tokio::select! {
				_ = &mut deadline => break,
				out = direct_rx.recv() => match out {
					Some(Outbound::Message(msg)) => self.drop_late(&msg),
					Some(Outbound::Shutdown) => {}
					None => {
						(&mut deadline).await;
						break;
					}
				},
			}
		}
	}

	fn drop_late(&self, msg: &Message) {
		warn!(conn_id = self.id, uid = self.uid(), cmd = %msg.cmd, "message dropped after shutdown");
		metrics::counter!("parley_server_messages_dropped_total").increment(1);
	}

	/// Writes everything pending, in append order. Producers keep appending to a fresh
	/// queue meanwhile. Returns the number of messages written.
	pub(crate) async fn flush_pending(&self, writer: &mut dyn MessageWriter) -> usize {
		let Some(messages) = self.pending.take() else {
			return 0;
		};

		for msg in &messages {
			self.deliver(writer, msg).await;
		}
		messages.len()
	}

	/// Metadata goes out first when present. Only real-time kinds are counted.
	pub(crate) async fn deliver(&self, writer: &mut dyn MessageWriter, msg: &Message) {
		if msg.cmd.is_realtime() {
			self.summary.message_out();
		}

		if let Some(meta) = &msg.meta {
			let meta_msg = Message::metadata(self.version(), meta.clone());
			self.write(writer, &meta_msg).await;
		}
		self.write(writer, msg).await;
	}

	async fn write(&self, writer: &mut dyn MessageWriter, msg: &Message) {
		match writer.send(msg).await {
			Ok(()) => {}
			Err(e @ TransportError::TimedOut(_)) => {
				warn!(conn_id = self.id, uid = self.uid(), cmd = %msg.cmd, error = %e, "peer is not reading");
				metrics::counter!("parley_server_write_timeouts_total").increment(1);
			}
			Err(e) => debug!(conn_id = self.id, uid = self.uid(), cmd = %msg.cmd, error = %e, "send failed"),
		}
	}

	#[cfg(test)]
	pub(crate) fn pending(&self) -> &PendingQueue {
		&self.pending
	}
}
