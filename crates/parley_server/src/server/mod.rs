#![forbid(unsafe_code)]

pub mod client;
pub mod health;
pub mod observer;
pub mod registry;
pub mod summary;
pub mod transport;

pub use client::{Client, ClientConfig, EnqueueError};
pub use observer::ClientObserver;
pub use registry::Registry;
pub use summary::{ServerSummary, SummarySnapshot};
pub use transport::{Connection, MessageReader, MessageWriter, TransportError};

#[cfg(test)]
mod mock;
