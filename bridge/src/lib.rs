//! Host side of the tether bridge.
//!
//! The host cannot receive callbacks from the remote context; it can only
//! invoke `poll` and `release` on a [`BridgeHandle`]. A [`BridgeController`]
//! turns that into a push-style event stream by running one long poll at a
//! time and fanning the results out to [`BridgeObserver`]s.

mod controller;
mod handle;
mod local;
mod observer;
mod rpc;

pub use controller::{BridgeController, BridgeOptions, BridgeState};
pub use handle::{BridgeHandle, RemoteError, RemoteFut};
pub use local::LocalHandle;
pub use observer::{BridgeNotification, BridgeObserver};
pub use rpc::RpcHandle;
