#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parley_protocol::Message;

use crate::server::client::Client;

/// Session logic plugged into a [`Client`].
#[async_trait]
pub trait ClientObserver: Send + Sync {
	/// Called from the client's read loop for every inbound message. The next read
	/// does not start until this returns.
	async fn on_client_message(&self, client: &Arc<Client>, msg: Message);

	/// Called once, after the connection counters were updated and the write loop was
	/// told to stop.
	async fn on_client_close(&self, client: &Arc<Client>);
}
