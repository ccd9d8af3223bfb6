#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parley_protocol::{Command, DEFAULT_MAX_FRAME_SIZE, Message, MessageCodec};
use parley_server::server::{Client, ClientObserver, Connection, Registry, ServerSummary};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("PARLEY_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

/// Binds an ephemeral listener and runs the accept loop the binary uses.
async fn start_server() -> anyhow::Result<(SocketAddr, Arc<ServerSummary>)> {
	let listener = TcpListener::bind("127.0.0.1:0").await.context("bind test listener")?;
	let addr = listener.local_addr()?;

	let summary = Arc::new(ServerSummary::new());
	let registry: Arc<dyn ClientObserver> = Arc::new(Registry::new(Arc::clone(&summary)));

	let accept_summary = Arc::clone(&summary);
	tokio::spawn(async move {
		while let Ok((stream, _remote)) = listener.accept().await {
			let client = Client::new(
				Connection::tcp(stream, DEFAULT_MAX_FRAME_SIZE),
				Arc::clone(&accept_summary),
				Arc::clone(&registry),
			);
			client.run();
		}
	});

	Ok((addr, summary))
}

struct TestPeer {
	rx: FramedRead<OwnedReadHalf, MessageCodec>,
	tx: FramedWrite<OwnedWriteHalf, MessageCodec>,
}

impl TestPeer {
	async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
		let stream = TcpStream::connect(addr).await.context("connect")?;
		let (read, write) = stream.into_split();
		Ok(Self {
			rx: FramedRead::new(read, MessageCodec::default()),
			tx: FramedWrite::new(write, MessageCodec::default()),
		})
	}

	async fn send(&mut self, msg: Message) -> anyhow::Result<()> {
		self.tx.send(msg).await.context("send frame")
	}

	async fn recv(&mut self) -> anyhow::Result<Message> {
		match tokio::time::timeout(RECV_TIMEOUT, self.rx.next()).await {
			Ok(Some(Ok(msg))) => Ok(msg),
			Ok(Some(Err(e))) => Err(anyhow!(e).context("decode frame")),
			Ok(None) => Err(anyhow!("server closed the connection")),
			Err(_) => Err(anyhow!("timed out waiting for a frame")),
		}
	}

	async fn login(&mut self, uid: i64) -> anyhow::Result<()> {
		self.send(Message::new(Command::AUTH_TOKEN, uid.to_string()).with_seq(1))
			.await?;
		let status = self.recv().await?;
		anyhow::ensure!(status.cmd == Command::AUTH_STATUS, "expected AUTH_STATUS, got {}", status.cmd);
		anyhow::ensure!(&status.body[..] == [0u8], "login rejected for uid {uid}");
		Ok(())
	}
}

fn addressed(cmd: Command, target: i64, content: &[u8]) -> Message {
	let mut body = BytesMut::new();
	body.put_i64(target);
	body.extend_from_slice(content);
	Message::new(cmd, body.freeze())
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
	let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
	while tokio::time::Instant::now() < deadline {
		if done() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	done()
}

#[tokio::test]
async fn ping_round_trips_over_tcp() -> anyhow::Result<()> {
	init_test_logging();
	let (addr, _summary) = start_server().await?;

	let mut peer = TestPeer::connect(addr).await?;
	peer.send(Message::new(Command::PING, Bytes::new()).with_seq(42)).await?;

	let pong = peer.recv().await?;
	assert_eq!(pong.cmd, Command::PONG);
	assert_eq!(pong.seq, 42);
	Ok(())
}

#[tokio::test]
async fn peer_message_is_delivered_between_connections() -> anyhow::Result<()> {
	init_test_logging();
	let (addr, summary) = start_server().await?;

	let mut alice = TestPeer::connect(addr).await?;
	let mut bob = TestPeer::connect(addr).await?;
	alice.login(10).await?;
	bob.login(20).await?;
	assert_eq!(summary.snapshot().clients, 2);

	alice
		.send(addressed(Command::IM, 20, b"over the wire").with_seq(7).with_meta("trace"))
		.await?;

	let ack = alice.recv().await?;
	assert_eq!(ack.cmd, Command::ACK);
	assert_eq!(&ack.body[..], &7u32.to_be_bytes());

	let meta = bob.recv().await?;
	assert_eq!(meta.cmd, Command::METADATA);
	assert_eq!(meta.body, Bytes::from_static(b"trace"));

	let im = bob.recv().await?;
	assert_eq!(im.cmd, Command::IM);
	assert_eq!(&im.body[..8], &10i64.to_be_bytes());
	assert_eq!(&im.body[8..], b"over the wire");
	Ok(())
}

#[tokio::test]
async fn disconnect_releases_counters() -> anyhow::Result<()> {
	init_test_logging();
	let (addr, summary) = start_server().await?;

	let mut peer = TestPeer::connect(addr).await?;
	peer.login(5).await?;
	assert_eq!(summary.snapshot().connections, 1);

	drop(peer);

	let released = wait_until(|| {
		let snap = summary.snapshot();
		snap.connections == 0 && snap.clients == 0
	})
	.await;
	assert!(released, "counters not released: {:?}", summary.snapshot());
	Ok(())
}
