#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

/// Process-wide counters shared by every client of one server instance.
///
/// Connection code only ever adds to or subtracts from these; reading is left to
/// reporting surfaces such as the stats endpoint. Every update is mirrored into the
/// `metrics` facade.
#[derive(Debug, Default)]
pub struct ServerSummary {
	connections: AtomicI64,
	clients: AtomicI64,
	in_messages: AtomicI64,
	out_messages: AtomicI64,
}

/// Point-in-time copy of [`ServerSummary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SummarySnapshot {
	pub connections: i64,
	pub clients: i64,
	pub in_messages: i64,
	pub out_messages: i64,
}

impl ServerSummary {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn connection_opened(&self) {
		self.connections.fetch_add(1, Ordering::Relaxed);
		metrics::gauge!("parley_server_active_connections").increment(1.0);
	}

	pub fn connection_closed(&self) {
		self.connections.fetch_sub(1, Ordering::Relaxed);
		metrics::gauge!("parley_server_active_connections").decrement(1.0);
	}

	/// A connection completed authentication.
	pub fn client_authenticated(&self) {
		self.clients.fetch_add(1, Ordering::Relaxed);
		metrics::gauge!("parley_server_active_clients").increment(1.0);
	}

	pub fn client_closed(&self) {
		self.clients.fetch_sub(1, Ordering::Relaxed);
		metrics::gauge!("parley_server_active_clients").decrement(1.0);
	}

	pub fn message_in(&self) {
		self.in_messages.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("parley_server_messages_in_total").increment(1);
	}

	/// A real-time message was written towards a client.
	pub fn message_out(&self) {
		self.out_messages.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("parley_server_messages_out_total").increment(1);
	}

	pub fn snapshot(&self) -> SummarySnapshot {
		SummarySnapshot {
			connections: self.connections.load(Ordering::Relaxed),
			clients: self.clients.load(Ordering::Relaxed),
			in_messages: self.in_messages.load(Ordering::Relaxed),
			out_messages: self.out_messages.load(Ordering::Relaxed),
		}
	}
}
