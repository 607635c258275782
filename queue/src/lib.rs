//! Remote-side half of the tether bridge.
//!
//! A [`RemoteQueue`] lives inside the context that produces events. Producers
//! call [`RemoteQueue::post`]; a single host-side consumer drains the queue
//! with long polls ([`RemoteQueue::poll`]), either in-process or across the
//! framed JSON-RPC transport served by [`serve`].

pub mod codec;
pub mod protocol;

mod queue;
mod server;

pub use queue::{ContractViolation, QueueError, RemoteQueue};
pub use server::serve;
