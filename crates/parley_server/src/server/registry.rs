#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parley_protocol::version::MAX_PROTOCOL_VERSION;
use parley_protocol::{Command, Message};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::server::client::{Client, EnqueueError};
use crate::server::observer::ClientObserver;
use crate::server::summary::ServerSummary;

/// `AUTH_STATUS` body byte for a successful login.
pub const AUTH_OK: u8 = 0;
pub const AUTH_FAILED: u8 = 1;

/// Routes messages between authenticated clients and chat rooms.
///
/// Message bodies addressed to a user or room start with the 8-byte big-endian target id.
/// Forwarded bodies replace it with the sender uid (rooms keep the room id in front).
#[derive(Debug)]
pub struct Registry {
	summary: Arc<ServerSummary>,
	inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	clients_by_uid: HashMap<i64, Vec<Arc<Client>>>,
	rooms: HashMap<i64, HashMap<u64, Arc<Client>>>,
	rooms_by_conn: HashMap<u64, HashSet<i64>>,
}

impl Registry {
	pub fn new(summary: Arc<ServerSummary>) -> Self {
		Self {
			summary,
			inner: RwLock::new(Inner::default()),
		}
	}

	/// Number of live clients logged in as `uid`.
	pub async fn clients_for_uid(&self, uid: i64) -> usize {
		let inner = self.inner.read().await;
		inner.clients_by_uid.get(&uid).map(Vec::len).unwrap_or(0)
	}

	pub async fn room_member_count(&self, room_id: i64) -> usize {
		let inner = self.inner.read().await;
		inner.rooms.get(&room_id).map(HashMap::len).unwrap_or(0)
	}

	async fn handle_auth(&self, client: &Arc<Client>, msg: Message) {
		let uid = std::str::from_utf8(&msg.body)
			.ok()
			.and_then(|s| s.trim().parse::<i64>().ok())
			.filter(|uid| *uid > 0);

		let status = match uid {
			Some(uid) if client.uid() == 0 => {
				client.set_uid(uid);
				client.set_version(msg.version.clamp(1, MAX_PROTOCOL_VERSION));
				self.summary.client_authenticated();

				let mut inner = self.inner.write().await;
				inner.clients_by_uid.entry(uid).or_default().push(Arc::clone(client));
				info!(conn_id = client.id(), uid, version = client.version(), "client authenticated");
				AUTH_OK
			}
			_ => {
				warn!(conn_id = client.id(), uid = client.uid(), "auth rejected");
				AUTH_FAILED
			}
		};

		reply(client, Message::new(Command::AUTH_STATUS, vec![status]).with_seq(msg.seq)).await;
	}

	async fn handle_peer_message(&self, client: &Arc<Client>, msg: Message) {
		let Some((receiver, content)) = split_target(&msg.body) else {
			debug!(conn_id = client.id(), cmd = %msg.cmd, "malformed peer message");
			return;
		};
		self.summary.message_in();

		let mut body = BytesMut::with_capacity(8 + content.len());
		body.put_i64(client.uid());
		body.extend_from_slice(&content);
		let forward = forwarded(&msg, body.freeze());

		let targets = {
			let inner = self.inner.read().await;
			inner.clients_by_uid.get(&receiver).cloned().unwrap_or_default()
		};
		if targets.is_empty() {
			debug!(uid = client.uid(), receiver, "receiver offline");
		}
		for target in targets {
			if target.enqueue_message(forward.clone()).is_err() {
				debug!(conn_id = target.id(), receiver, "receiver closed before delivery");
			}
		}

		if msg.cmd == Command::IM {
			let ack = Message::new(Command::ACK, msg.seq.to_be_bytes().to_vec());
			reply(client, ack).await;
		}
	}

	async fn handle_room_membership(&self, client: &Arc<Client>, msg: Message) {
		let Some((room_id, _)) = split_target(&msg.body) else {
			debug!(conn_id = client.id(), cmd = %msg.cmd, "malformed room request");
			return;
		};

		let mut inner = self.inner.write().await;
		if msg.cmd == Command::ENTER_ROOM {
			inner.rooms.entry(room_id).or_default().insert(client.id(), Arc::clone(client));
			inner.rooms_by_conn.entry(client.id()).or_default().insert(room_id);
			debug!(uid = client.uid(), room_id, "entered room");
		} else {
			inner.leave_room(client.id(), room_id);
			if let Some(joined) = inner.rooms_by_conn.get_mut(&client.id()) {
				joined.remove(&room_id);
			}
			debug!(uid = client.uid(), room_id, "left room");
		}
	}

	async fn handle_room_message(&self, client: &Arc<Client>, msg: Message) {
		let Some((room_id, content)) = split_target(&msg.body) else {
			debug!(conn_id = client.id(), "malformed room message");
			return;
		};
		self.summary.message_in();

		let members: Vec<Arc<Client>> = {
			let inner = self.inner.read().await;
			let Some(room) = inner.rooms.get(&room_id) else {
				debug!(uid = client.uid(), room_id, "room message for unknown room");
				return;
			};
			if !room.contains_key(&client.id()) {
				debug!(uid = client.uid(), room_id, "room message from non-member");
				return;
			}
			room.values().filter(|c| c.id() != client.id()).cloned().collect()
		};

		let mut body = BytesMut::with_capacity(16 + content.len());
		body.put_i64(room_id);
		body.put_i64(client.uid());
		body.extend_from_slice(&content);
		let forward = forwarded(&msg, body.freeze());

		for member in members {
			// A member that cannot keep up is cut off rather than stalling this sender.
			match member.try_send_messages(vec![forward.clone()]) {
				Ok(()) => {}
				Err(EnqueueError::Full) => {
					warn!(uid = member.uid(), conn_id = member.id(), room_id, "room member backlogged, throttling");
					member.throttle();
				}
				Err(EnqueueError::Closed) => {}
			}
		}
	}
}

impl Inner {
	fn leave_room(&mut self, conn_id: u64, room_id: i64) {
		if let Some(room) = self.rooms.get_mut(&room_id) {
			room.remove(&conn_id);
			if room.is_empty() {
				self.rooms.remove(&room_id);
			}
		}
	}
}

#[async_trait]
impl ClientObserver for Registry {
	async fn on_client_message(&self, client: &Arc<Client>, msg: Message) {
		match msg.cmd {
			Command::AUTH_TOKEN => self.handle_auth(client, msg).await,
			Command::PING => reply(client, Message::new(Command::PONG, Bytes::new()).with_seq(msg.seq)).await,
			cmd if client.uid() == 0 => {
				debug!(conn_id = client.id(), %cmd, "ignoring message from unauthenticated client");
			}
			Command::IM | Command::RT => self.handle_peer_message(client, msg).await,
			Command::ENTER_ROOM | Command::LEAVE_ROOM => self.handle_room_membership(client, msg).await,
			Command::ROOM_IM => self.handle_room_message(client, msg).await,
			cmd => debug!(conn_id = client.id(), uid = client.uid(), %cmd, "unhandled command"),
		}
	}

	async fn on_client_close(&self, client: &Arc<Client>) {
		let mut inner = self.inner.write().await;

		let uid = client.uid();
		if uid > 0
			&& let Some(clients) = inner.clients_by_uid.get_mut(&uid)
		{
			clients.retain(|c| c.id() != client.id());
			if clients.is_empty() {
				inner.clients_by_uid.remove(&uid);
			}
		}

		if let Some(joined) = inner.rooms_by_conn.remove(&client.id()) {
			for room_id in joined {
				inner.leave_room(client.id(), room_id);
			}
		}

		info!(conn_id = client.id(), uid, "client closed");
	}
}

async fn reply(client: &Arc<Client>, msg: Message) {
	if let Err(e) = client.send_message(msg).await {
		debug!(conn_id = client.id(), error = %e, "reply dropped");
	}
}

/// Copy of `msg` with a new body; seq is per-connection so it is reset.
fn forwarded(msg: &Message, body: Bytes) -> Message {
	Message {
		cmd: msg.cmd,
		seq: 0,
		version: msg.version,
		flag: msg.flag,
		body,
		meta: msg.meta.clone(),
	}
}

/// Splits an 8-byte big-endian target id off the front of a body.
fn split_target(body: &Bytes) -> Option<(i64, Bytes)> {
	let head: [u8; 8] = body.get(..8)?.try_into().ok()?;
	Some((i64::from_be_bytes(head), body.slice(8..)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_target_reads_big_endian_prefix() {
		let mut body = BytesMut::new();
		body.put_i64(42);
		body.extend_from_slice(b"hello");

		let (target, rest) = split_target(&body.freeze()).expect("target");
		assert_eq!(target, 42);
		assert_eq!(&rest[..], b"hello");
	}

	#[test]
	fn split_target_rejects_short_bodies() {
		assert!(split_target(&Bytes::from_static(b"1234567")).is_none());
	}
}
